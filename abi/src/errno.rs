//! POSIX errno values (Linux numbering).
//!
//! The stack returns these negated at the socket boundary, e.g. `-ERRNO_EBADF`.

pub const ERRNO_EPERM: i32 = 1;
pub const ERRNO_ENOENT: i32 = 2;
pub const ERRNO_EINTR: i32 = 4;
pub const ERRNO_ENXIO: i32 = 6;
pub const ERRNO_EBADF: i32 = 9;
pub const ERRNO_EAGAIN: i32 = 11;
pub const ERRNO_EBUSY: i32 = 16;
pub const ERRNO_EEXIST: i32 = 17;
pub const ERRNO_ENODEV: i32 = 19;
pub const ERRNO_EINVAL: i32 = 22;
pub const ERRNO_ENOSPC: i32 = 28;
pub const ERRNO_EPIPE: i32 = 32;
pub const ERRNO_ENOTSOCK: i32 = 88;
pub const ERRNO_EMSGSIZE: i32 = 90;
pub const ERRNO_EPROTONOSUPPORT: i32 = 93;
pub const ERRNO_ESOCKTNOSUPPORT: i32 = 94;
pub const ERRNO_EOPNOTSUPP: i32 = 95;
pub const ERRNO_EAFNOSUPPORT: i32 = 97;
pub const ERRNO_EADDRINUSE: i32 = 98;
pub const ERRNO_EADDRNOTAVAIL: i32 = 99;
pub const ERRNO_ENETDOWN: i32 = 100;
pub const ERRNO_ENETUNREACH: i32 = 101;
pub const ERRNO_ECONNRESET: i32 = 104;
pub const ERRNO_ENOBUFS: i32 = 105;
pub const ERRNO_ENOTCONN: i32 = 107;
pub const ERRNO_ETIMEDOUT: i32 = 110;
pub const ERRNO_ECONNREFUSED: i32 = 111;
pub const ERRNO_EHOSTUNREACH: i32 = 113;
