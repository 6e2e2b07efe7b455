//! Delay iterators fed to [`crate::retry::Retry`].

pub mod exponential;
