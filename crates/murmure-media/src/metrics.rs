//! Call quality accounting: RTT, packet loss and bitrate.

use std::collections::VecDeque;

/// Smoothing factor for the RTT moving average.
const RTT_EWMA_ALPHA: f64 = 0.2;

/// Frame sizes kept for the bitrate estimate.
const BITRATE_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Unknown,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallMetrics {
    pub rtt_avg_ms: Option<f64>,
    pub rtt_min_ms: Option<f64>,
    pub rtt_max_ms: Option<f64>,

    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    packets_expected: u64,
    last_seq_received: Option<u32>,

    pub bytes_sent: u64,
    pub bytes_received: u64,
    frame_sizes: VecDeque<usize>,
    frames_per_second: f64,

    pub encode_errors: u64,
    pub decode_errors: u64,
}

impl CallMetrics {
    pub fn new(frame_ms: u32) -> Self {
        Self {
            frames_per_second: 1000.0 / frame_ms.max(1) as f64,
            ..Self::default()
        }
    }

    /// Fold a new RTT sample into the EWMA (alpha = 0.2).
    pub fn record_rtt(&mut self, rtt_ms: f64) {
        self.rtt_avg_ms = Some(match self.rtt_avg_ms {
            None => rtt_ms,
            Some(avg) => RTT_EWMA_ALPHA * rtt_ms + (1.0 - RTT_EWMA_ALPHA) * avg,
        });
        self.rtt_min_ms = Some(self.rtt_min_ms.map_or(rtt_ms, |m| m.min(rtt_ms)));
        self.rtt_max_ms = Some(self.rtt_max_ms.map_or(rtt_ms, |m| m.max(rtt_ms)));
    }

    pub fn record_sent(&mut self, size: usize) {
        self.packets_sent += 1;
        self.bytes_sent += size as u64;
        if self.frame_sizes.len() == BITRATE_WINDOW {
            self.frame_sizes.pop_front();
        }
        self.frame_sizes.push_back(size);
    }

    /// Record an inbound audio frame and infer loss from sequence gaps.
    pub fn record_received(&mut self, seq: u32, size: usize) {
        self.packets_received += 1;
        self.bytes_received += size as u64;

        if let Some(last) = self.last_seq_received {
            let gap = seq.wrapping_sub(last);
            if gap > 1 && (gap as i32) > 0 {
                self.packets_lost += (gap - 1) as u64;
                self.packets_expected += (gap - 1) as u64;
            }
        }
        self.last_seq_received = Some(seq);
        self.packets_expected += 1;
    }

    pub fn loss_percentage(&self) -> f64 {
        if self.packets_expected == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_expected as f64 * 100.0
        }
    }

    /// Average outbound bitrate over the recent frame window, in kbit/s.
    pub fn avg_bitrate_kbps(&self) -> f64 {
        if self.frame_sizes.is_empty() {
            return 0.0;
        }
        let avg_bytes =
            self.frame_sizes.iter().sum::<usize>() as f64 / self.frame_sizes.len() as f64;
        avg_bytes * 8.0 * self.frames_per_second / 1000.0
    }

    /// Coarse quality bucket from RTT and loss, for the UI.
    pub fn connection_quality(&self) -> ConnectionQuality {
        let Some(rtt) = self.rtt_avg_ms else {
            return ConnectionQuality::Unknown;
        };
        if self.packets_expected < 10 {
            return ConnectionQuality::Unknown;
        }

        let rtt_score = if rtt < 200.0 {
            2
        } else if rtt < 500.0 {
            1
        } else {
            0
        };
        let loss = self.loss_percentage();
        let loss_score = if loss < 2.0 {
            2
        } else if loss < 5.0 {
            1
        } else {
            0
        };

        match rtt_score + loss_score {
            3 | 4 => ConnectionQuality::Good,
            1 | 2 => ConnectionQuality::Fair,
            _ => ConnectionQuality::Poor,
        }
    }
}
