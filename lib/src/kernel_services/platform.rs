crate::define_service! {
    platform => PlatformServices {
        /// Monotonic nanoseconds since boot.
        clock_monotonic_ns() -> u64;
        /// Disable interrupts on this CPU, returning the previous flags.
        irq_save() -> u64;
        /// Restore flags returned by `irq_save`.
        irq_restore(flags: u64);
        rng_next() -> u64;
    }
}
