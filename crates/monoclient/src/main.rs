//! monoclient: plays a lonelyradio server in the terminal.
//!
//! Prints one line per track (`artist - album - title (m:ss)`) and stops cleanly on Ctrl-C.
//! With `--download` it fetches a single track to a raw sample file instead.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::{select, tick, unbounded};
use monolib::{EngineConfig, NullOutput, OutputFormat, PlaybackState, Player, Settings, TrackMetadata};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,monoclient=info,monolib=info")
        }))
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        for (i, name) in monolib::device::list_devices(&host)?.iter().enumerate() {
            println!("{i}: {name}");
        }
        return Ok(());
    }

    let server = args.address.as_deref().context("server address required")?;
    let mut config = engine_config(&args);
    if let Some(path) = &args.xor_key_file {
        config.xor_key = Some(monolib::load_xor_key(path)?);
    }

    if args.list {
        for name in monolib::list_playlists(server, &config)? {
            println!("{name}");
        }
        return Ok(());
    }

    let settings = Settings::from_codes(
        monolib::Encoder::from(args.encoder).code(),
        args.cover,
        args.playlist.as_deref(),
    )?;

    if let Some(path) = &args.download {
        let track = monolib::get_track(server, &settings, &config)?;
        let bytes: Vec<u8> = track.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))?;
        println!(
            "Downloaded: {} ({} Hz, {} ch, {} frames) -> {}",
            describe(&track.metadata),
            track.sample_rate,
            track.channels,
            track.frames(),
            path.display()
        );
        return Ok(());
    }

    let player = if args.null_output {
        let format = OutputFormat {
            sample_rate: config.output_rate.unwrap_or(48_000),
            channels: 2,
        };
        Player::new(Arc::new(NullOutput::new(format)), config)
    } else {
        Player::with_cpal(config)
    };
    player.set_volume(args.volume);

    let (stop_tx, stop_rx) = unbounded();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("install Ctrl-C handler")?;

    player
        .start(server, settings)
        .with_context(|| format!("start playback from {server}"))?;

    let result = watch(&player, &stop_rx);
    player.stop();
    result
}

fn engine_config(args: &cli::Args) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(device) = &args.device {
        config.device = Some(device.clone());
    }
    if let Some(rate) = args.sample_rate {
        config.output_rate = Some(rate);
    }
    if let Some(secs) = args.buffer_seconds {
        config.buffer_seconds = secs;
    }
    config
}

/// Print track changes until Ctrl-C or a session error.
fn watch(player: &Player, stop_rx: &crossbeam_channel::Receiver<()>) -> Result<()> {
    let ticker = tick(Duration::from_millis(250));
    let mut shown: Option<Arc<TrackMetadata>> = None;
    loop {
        select! {
            recv(stop_rx) -> _ => {
                tracing::info!("interrupted");
                return Ok(());
            }
            recv(ticker) -> _ => {
                if let Some(md) = player.metadata()
                    && !shown.as_ref().is_some_and(|s| Arc::ptr_eq(s, &md))
                {
                    println!("{}", describe(&md));
                    shown = Some(md);
                }
                if player.state() == PlaybackState::Error {
                    return Err(match player.last_error() {
                        Some(e) => anyhow!(e),
                        None => anyhow!("playback failed"),
                    });
                }
            }
        }
    }
}

fn describe(md: &TrackMetadata) -> String {
    let field = |v: &Option<String>| v.as_deref().unwrap_or("?").to_string();
    let mut line = format!("{} - {} - {}", field(&md.artist), field(&md.album), field(&md.title));
    if let Some(secs) = md.length_seconds {
        line.push_str(&format!(" ({})", format_duration(secs)));
    }
    line
}

fn format_duration(secs: f32) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use monolib::Encoder;

    fn metadata(length_seconds: Option<f32>) -> TrackMetadata {
        TrackMetadata {
            artist: Some("Miles Davis".to_string()),
            album: Some("Kind of Blue".to_string()),
            title: Some("So What".to_string()),
            length_seconds,
            cover: None,
            sample_rate: 44_100,
            channels: 2,
            encoder: Encoder::Flac,
        }
    }

    #[test]
    fn formats_minutes_and_seconds() {
        assert_eq!(format_duration(0.0), "0:00");
        assert_eq!(format_duration(65.4), "1:05");
        assert_eq!(format_duration(562.0), "9:22");
        assert_eq!(format_duration(3_600.0), "60:00");
    }

    #[test]
    fn describes_track_line() {
        assert_eq!(
            describe(&metadata(Some(562.0))),
            "Miles Davis - Kind of Blue - So What (9:22)"
        );
        let mut live = metadata(None);
        live.album = None;
        assert_eq!(describe(&live), "Miles Davis - ? - So What");
    }

    #[test]
    fn flags_override_environment_config() {
        let args = cli::Args::try_parse_from([
            "monoclient",
            "x:1",
            "--device",
            "USB",
            "--sample-rate",
            "96000",
            "--buffer-seconds",
            "4",
        ])
        .unwrap();
        let config = engine_config(&args);
        assert_eq!(config.device.as_deref(), Some("USB"));
        assert_eq!(config.output_rate, Some(96_000));
        assert_eq!(config.buffer_seconds, 4.0);
    }
}
