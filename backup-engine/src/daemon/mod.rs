//! Host-side process lifecycle.

pub mod shutdown;
