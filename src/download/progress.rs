// Chunkload - Resumable Encrypted Chunked Transfers
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Transfer progress tracking and reporting
//!
//! # Progress Information
//! - Operation id and file name for identification
//! - Bytes downloaded / total bytes
//! - Current speed with moving average
//! - Time remaining (estimated) and percentage complete
//! - Transfer state, priority and activity for the admission scheduler

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Lifecycle of a transfer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Created, `start()` not called yet
    Idle,
    /// Requests are being issued or awaited
    Downloading,
    /// All bytes are on disk (or the preload budget was reached)
    Finished,
    /// Terminated by an error
    Failed,
    /// Terminated by the caller
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Finished | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Progress snapshot for a single transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Operation identifier used in logs
    pub operation_id: String,

    /// Final file name for display
    pub file_name: String,

    /// Bytes downloaded so far
    pub bytes_downloaded: u64,

    /// Total bytes to download (0 if unknown)
    pub total_bytes: u64,

    /// Percentage complete (0.0 - 100.0)
    pub percent_complete: f64,

    /// Current download speed in bytes per second
    pub download_speed: f64,

    /// Estimated time remaining in seconds (0 if unknown)
    pub eta_seconds: u64,

    /// Current state of the transfer
    pub state: TransferState,

    /// Scheduling is suspended by `pause()`
    pub paused: bool,

    /// Priority reported to the admission scheduler
    pub priority: i32,

    /// Optional error message if state is Failed
    pub error_message: Option<String>,
}

impl TransferProgress {
    /// Create a new progress snapshot
    pub fn new(operation_id: String, file_name: String, total_bytes: u64) -> Self {
        Self {
            operation_id,
            file_name,
            bytes_downloaded: 0,
            total_bytes,
            percent_complete: 0.0,
            download_speed: 0.0,
            eta_seconds: 0,
            state: TransferState::Idle,
            paused: false,
            priority: 0,
            error_message: None,
        }
    }

    /// Started and not paused
    pub fn is_active(&self) -> bool {
        self.state == TransferState::Downloading && !self.paused
    }

    /// Calculate percentage from bytes
    pub fn calculate_percentage(&mut self) {
        if self.total_bytes > 0 {
            self.percent_complete = (self.bytes_downloaded as f64 / self.total_bytes as f64) * 100.0;
        } else {
            self.percent_complete = 0.0;
        }
    }

    /// Calculate ETA from speed and remaining bytes
    pub fn calculate_eta(&mut self) {
        if self.download_speed > 0.0 && self.total_bytes > 0 {
            let remaining_bytes = self.total_bytes.saturating_sub(self.bytes_downloaded);
            self.eta_seconds = (remaining_bytes as f64 / self.download_speed) as u64;
        } else {
            self.eta_seconds = 0;
        }
    }

    /// Format download speed as human-readable string (e.g., "2.5 MB/s")
    pub fn speed_string(&self) -> String {
        let mb_per_sec = self.download_speed / 1_000_000.0;
        format!("{:.1} MB/s", mb_per_sec)
    }

    /// Format progress as display string
    pub fn display_string(&self) -> String {
        match self.state {
            TransferState::Idle => format!("{}: Waiting", self.file_name),
            TransferState::Downloading if self.paused => {
                format!("{}: Paused at {:.1}%", self.file_name, self.percent_complete)
            }
            TransferState::Downloading => format!(
                "{}: {:.1}% ({} / {} bytes) - {}",
                self.file_name,
                self.percent_complete,
                self.bytes_downloaded,
                self.total_bytes,
                self.speed_string()
            ),
            TransferState::Finished => format!("{}: Completed", self.file_name),
            TransferState::Failed => format!(
                "{}: Failed - {}",
                self.file_name,
                self.error_message.as_deref().unwrap_or("Unknown error")
            ),
            TransferState::Cancelled => format!("{}: Cancelled", self.file_name),
        }
    }
}

/// Speed tracker with moving average
///
/// Uses a sliding window approach to smooth out network fluctuations
#[derive(Debug)]
pub struct SpeedTracker {
    /// Samples within the time window
    samples: VecDeque<SpeedSample>,

    /// Time window for averaging (default 10 seconds)
    window_duration: Duration,
}

#[derive(Debug, Clone)]
struct SpeedSample {
    timestamp: Instant,
    position: u64,
}

impl SpeedTracker {
    /// Create new speed tracker with default 10-second window
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10))
    }

    pub fn with_window(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
        }
    }

    /// Add a position sample (total bytes downloaded so far)
    pub fn add_position(&mut self, position: u64) {
        let now = Instant::now();

        // A rewind (migration, restart) invalidates older samples
        if self.samples.back().is_some_and(|s| s.position > position) {
            self.samples.clear();
        }
        self.samples.push_back(SpeedSample {
            timestamp: now,
            position,
        });

        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.timestamp) > self.window_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Get current average speed in bytes per second
    pub fn average_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let bytes_delta = last.position.saturating_sub(first.position);
        let time_delta = last.timestamp.duration_since(first.timestamp).as_secs_f64();

        if time_delta > 0.0 {
            bytes_delta as f64 / time_delta
        } else {
            0.0
        }
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress snapshot plus speed tracking, owned by the operation task
#[derive(Debug)]
pub struct ProgressTracker {
    progress: TransferProgress,
    speed_tracker: SpeedTracker,
}

impl ProgressTracker {
    pub fn new(operation_id: String, file_name: String, total_bytes: u64) -> Self {
        Self {
            progress: TransferProgress::new(operation_id, file_name, total_bytes),
            speed_tracker: SpeedTracker::new(),
        }
    }

    /// Update progress with new position
    pub fn update(&mut self, bytes_downloaded: u64, total_bytes: u64) {
        self.progress.bytes_downloaded = bytes_downloaded;
        self.progress.total_bytes = total_bytes;
        self.speed_tracker.add_position(bytes_downloaded);

        self.progress.download_speed = self.speed_tracker.average_speed();
        self.progress.calculate_percentage();
        self.progress.calculate_eta();
    }

    pub fn set_state(&mut self, state: TransferState) {
        self.progress.state = state;
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.progress.paused = paused;
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.progress.priority = priority;
    }

    /// Set error message and state to Failed
    pub fn set_error(&mut self, message: String) {
        self.progress.state = TransferState::Failed;
        self.progress.error_message = Some(message);
    }

    pub fn get_progress(&self) -> &TransferProgress {
        &self.progress
    }

    pub fn clone_progress(&self) -> TransferProgress {
        self.progress.clone()
    }
}
