//! `define_service!`: typed function-pointer tables for kernel services.
//!
//! Subsystems that must call into the scheduler or platform layer without a
//! crate dependency on them declare a service table here.  The provider
//! registers a `&'static` table once at boot; consumers call the generated
//! free functions.
//!
//! ```rust,ignore
//! crate::define_service! {
//!     platform => PlatformServices {
//!         clock_monotonic_ns() -> u64;
//!         irq_save() -> u64;
//!     }
//! }
//! ```
//!
//! expands to a `PlatformServices` struct of `fn` pointers and:
//!
//! - `register_platform_services(&'static PlatformServices)`
//! - `is_platform_initialized() -> bool`
//! - `platform_services() -> Option<&'static PlatformServices>`
//! - one wrapper per method (`clock_monotonic_ns()`, `irq_save()`)
//!
//! Until a table is registered every wrapper returns `Default::default()` for
//! its return type, so early callers observe `0`, `false` or `()`.

#[macro_export]
macro_rules! define_service {
    (
        $name:ident => $table:ident {
            $(
                $(#[$meta:meta])*
                $method:ident ( $($arg:ident : $arg_ty:ty),* $(,)? ) $(-> $ret:ty)? ;
            )*
        }
    ) => {
        $crate::paste::paste! {
            /// Function-pointer table registered by the service provider.
            #[derive(Clone, Copy)]
            pub struct $table {
                $( pub $method: fn($($arg_ty),*) $(-> $ret)?, )*
            }

            static [<$name:upper _SERVICES>]: ::core::sync::atomic::AtomicPtr<$table> =
                ::core::sync::atomic::AtomicPtr::new(::core::ptr::null_mut());

            /// Install the provider's table.  Later registrations replace earlier ones.
            pub fn [<register_ $name _services>](services: &'static $table) {
                [<$name:upper _SERVICES>].store(
                    services as *const $table as *mut $table,
                    ::core::sync::atomic::Ordering::Release,
                );
            }

            #[inline]
            pub fn [<is_ $name _initialized>]() -> bool {
                ![<$name:upper _SERVICES>]
                    .load(::core::sync::atomic::Ordering::Acquire)
                    .is_null()
            }

            #[inline]
            pub fn [<$name _services>]() -> Option<&'static $table> {
                let ptr = [<$name:upper _SERVICES>].load(::core::sync::atomic::Ordering::Acquire);
                // SAFETY: only `&'static` tables are ever stored.
                unsafe { ptr.as_ref() }
            }

            $(
                $(#[$meta])*
                #[inline]
                pub fn $method($($arg: $arg_ty),*) $(-> $ret)? {
                    match [<$name _services>]() {
                        Some(services) => (services.$method)($($arg),*),
                        None => Default::default(),
                    }
                }
            )*
        }
    };
}
