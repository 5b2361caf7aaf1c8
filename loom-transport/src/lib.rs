// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

pub mod console;
pub mod retry;
pub mod telnet;

pub use console::{ConsoleConfig, ConsoleMultiplexer, MuxState};
pub use retry::{Backoff, RetryPolicy};
pub use telnet::{TelnetOptions, TelnetParser};
