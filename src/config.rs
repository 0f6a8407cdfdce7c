// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

/// Per-class request timeouts (in seconds): Urgent applies while a
/// global header-chain lock is held, Generic otherwise.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutClass {
    pub normal: Duration,
    pub relaxed: Duration,
    pub most_relaxed: Duration,
}

impl TimeoutClass {
    pub const GENERIC: TimeoutClass = TimeoutClass {
        normal: Duration::from_secs(30),
        relaxed: Duration::from_secs(45),
        most_relaxed: Duration::from_secs(180),
    };

    pub const URGENT: TimeoutClass = TimeoutClass {
        normal: Duration::from_secs(10),
        relaxed: Duration::from_secs(20),
        most_relaxed: Duration::from_secs(60),
    };
}

/// Configuration shared by every component of one `Interface`. Constructed
/// once by the caller (the multi-peer supervisor in production, a test
/// harness in unit tests) and handed around by `Arc`, never read from a
/// process-wide singleton.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Directory under which `certs/<host>` is pinned.
    pub data_dir: PathBuf,
    /// Sent as the first element of `server.version`.
    pub client_version: String,
    /// Sent as the second element of `server.version`.
    pub protocol_version: String,
    /// Maximum inbound JSON-RPC frame size, in bytes.
    pub max_frame_size: usize,
    /// Ceiling on concurrently in-flight requests per session.
    pub max_in_flight_requests: usize,
    /// Interval between `server.ping` keepalives.
    pub ping_interval: Duration,
    /// Polling interval for the liveness monitor.
    pub liveness_poll_interval: Duration,
}

impl InterfaceConfig {
    pub fn for_test(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            client_version: "test-client/0.0".to_string(),
            protocol_version: "1.4".to_string(),
            max_frame_size: 20 * 1024 * 1024,
            max_in_flight_requests: 100,
            ping_interval: Duration::from_secs(300),
            liveness_poll_interval: Duration::from_secs(1),
        }
    }

    pub fn cert_path(&self, host: &str) -> PathBuf {
        self.data_dir.join("certs").join(host)
    }
}
