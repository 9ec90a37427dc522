//! Transports for sending emails

pub mod smtp;
