#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod retry;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState, ErrorInfo, ErrorReason, Handlers};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
