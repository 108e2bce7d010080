//! Server CLI surface (spec §6.5), parsed with `clap` derive macros.

use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

/// One `-b/--benchmark` pass: `codec_id[;k=v]*` with keys
/// `n,ds,dt,dq,de,delay,bpp,bitrate` (spec §6.5).
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkPass {
    pub codec_id: String,
    /// `n` — number of frames to run this pass for.
    pub frame_count: Option<u32>,
    /// `ds` — timing-phase start offset, ms.
    pub timing_start_ms: Option<u32>,
    /// `dt` — timing-phase duration, ms.
    pub timing_duration_ms: Option<u32>,
    /// `dq` — image-quality-phase duration, ms.
    pub image_quality_duration_ms: Option<u32>,
    /// `de` — end-of-measurements offset past the image-quality phase, ms.
    pub end_margin_ms: Option<u32>,
    /// `delay` — artificial encoder delay to simulate, ms.
    pub encoder_delay_ms: Option<u32>,
    /// `bpp` — target bits per pixel.
    pub bits_per_pixel: Option<f64>,
    /// `bitrate` — target bitrate, bps.
    pub bitrate: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty benchmark pass")]
    Empty,
    #[error("malformed key=value pair: {0}")]
    MalformedPair(String),
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl FromStr for BenchmarkPass {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let codec_id = parts.next().filter(|s| !s.is_empty()).ok_or(ParseError::Empty)?.to_string();

        let mut pass = BenchmarkPass {
            codec_id,
            frame_count: None,
            timing_start_ms: None,
            timing_duration_ms: None,
            image_quality_duration_ms: None,
            end_margin_ms: None,
            encoder_delay_ms: None,
            bits_per_pixel: None,
            bitrate: None,
        };

        for pair in parts {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ParseError::MalformedPair(pair.to_string()))?;
            let invalid = || ParseError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "n" => pass.frame_count = Some(value.parse().map_err(|_| invalid())?),
                "ds" => pass.timing_start_ms = Some(value.parse().map_err(|_| invalid())?),
                "dt" => pass.timing_duration_ms = Some(value.parse().map_err(|_| invalid())?),
                "dq" => pass.image_quality_duration_ms = Some(value.parse().map_err(|_| invalid())?),
                "de" => pass.end_margin_ms = Some(value.parse().map_err(|_| invalid())?),
                "delay" => pass.encoder_delay_ms = Some(value.parse().map_err(|_| invalid())?),
                "bpp" => pass.bits_per_pixel = Some(value.parse().map_err(|_| invalid())?),
                "bitrate" => pass.bitrate = Some(value.parse().map_err(|_| invalid())?),
                other => return Err(ParseError::UnknownKey(other.to_string())),
            }
        }

        Ok(pass)
    }
}

/// `-n/--network "k=v[;k=v]*"` conditions (spec §6.5 keys `pc,pi,pt`):
/// packet-loss chance, packet-interval jitter, propagation delay. Parsed
/// here and carried through the config; actually emulating lossy/jittery
/// delivery is a collaborator this crate doesn't own (no software network
/// shim is wired in), so these values are surfaced for a future pipeline
/// stage to consume.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkConditions {
    /// `pc` — packet-loss chance, 0.0-1.0.
    pub packet_loss_chance: Option<f64>,
    /// `pi` — packet-interval jitter, ms.
    pub packet_interval_jitter_ms: Option<f64>,
    /// `pt` — propagation delay, ms.
    pub propagation_delay_ms: Option<f64>,
}

impl FromStr for NetworkConditions {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut conditions = NetworkConditions::default();
        for pair in s.split(';') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ParseError::MalformedPair(pair.to_string()))?;
            let invalid = || ParseError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "pc" => conditions.packet_loss_chance = Some(value.parse().map_err(|_| invalid())?),
                "pi" => conditions.packet_interval_jitter_ms = Some(value.parse().map_err(|_| invalid())?),
                "pt" => conditions.propagation_delay_ms = Some(value.parse().map_err(|_| invalid())?),
                other => return Err(ParseError::UnknownKey(other.to_string())),
            }
        }
        Ok(conditions)
    }
}

#[derive(Parser, Debug)]
#[command(name = "wvb-server", about = "Wireless VR bridge server")]
pub struct Args {
    /// One or more benchmark passes: `codec_id[;k=v]*`.
    #[arg(short = 'b', long = "benchmark", value_delimiter = ' ')]
    pub benchmark: Vec<BenchmarkPass>,

    /// Simulated network conditions: `k=v[;k=v]*`.
    #[arg(short = 'n', long = "network")]
    pub network: Option<NetworkConditions>,

    /// Pipeline poll interval, milliseconds.
    #[arg(long = "run-interval", visible_short_alias = 'r', default_value_t = 2)]
    pub run_interval_ms: u64,

    /// Preferred video codec id when no benchmark pass is active.
    #[arg(short = 'c', long = "codec", default_value = "h264")]
    pub codec: String,

    /// Path to the SteamVR installation (for driver registration).
    #[arg(long = "steamvr-path", visible_short_alias = 's')]
    pub steamvr_path: Option<String>,
}

impl Args {
    pub fn run_interval(&self) -> Duration {
        Duration::from_millis(self.run_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benchmark_pass_parses_codec_and_keys() {
        let pass: BenchmarkPass = "h264;n=500;bpp=0.1;bitrate=20000000".parse().unwrap();
        assert_eq!(pass.codec_id, "h264");
        assert_eq!(pass.frame_count, Some(500));
        assert_eq!(pass.bits_per_pixel, Some(0.1));
        assert_eq!(pass.bitrate, Some(20_000_000));
    }

    #[test]
    fn benchmark_pass_rejects_unknown_key() {
        assert!(matches!(
            "h264;zz=1".parse::<BenchmarkPass>(),
            Err(ParseError::UnknownKey(_))
        ));
    }

    #[test]
    fn network_conditions_parses_all_keys() {
        let n: NetworkConditions = "pc=0.01;pi=5;pt=40".parse().unwrap();
        assert_eq!(n.packet_loss_chance, Some(0.01));
        assert_eq!(n.packet_interval_jitter_ms, Some(5.0));
        assert_eq!(n.propagation_delay_ms, Some(40.0));
    }
}
