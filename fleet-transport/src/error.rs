// SPDX-License-Identifier: MIT

use fleet_model::ErrorClass;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("rpc {class}: {message}")]
pub struct RpcError {
    pub class: ErrorClass,
    pub message: String,
}

impl RpcError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Server, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    pub fn is_retriable(&self) -> bool {
        self.class.is_retriable()
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let class = match e.kind() {
            TimedOut | WouldBlock => ErrorClass::Timeout,
            ConnectionRefused | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected
            | AddrNotAvailable | UnexpectedEof => ErrorClass::Network,
            InvalidData => ErrorClass::Validation,
            PermissionDenied => ErrorClass::Auth,
            _ => ErrorClass::Unknown,
        };
        Self::new(class, e.to_string())
    }
}

impl From<bincode::Error> for RpcError {
    fn from(e: bincode::Error) -> Self {
        Self::new(ErrorClass::Validation, e.to_string())
    }
}
