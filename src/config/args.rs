//! CLI argument parsing using clap

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// voice-broadcast - live microphone broadcast over HTTP
///
/// Streams the microphone as 44.1 kHz mono 16-bit PCM to an ingest server,
/// or plays raw PCM of the same format.
#[derive(Parser, Debug)]
#[command(name = "voice-broadcast")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Settings file (default: platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Capture the microphone and upload it until Ctrl-C
    Stream {
        /// Ingest server base URL (overrides server.server_url)
        #[arg(long)]
        server: Option<String>,

        /// Broadcast id appended to the server URL (overrides server.broadcast_id)
        #[arg(long)]
        broadcast: Option<String>,
    },

    /// Play a raw canonical PCM file
    Play {
        file: PathBuf,

        /// Bytes handed to the player per chunk (overrides audio.playback_chunk_bytes)
        #[arg(long)]
        chunk_bytes: Option<usize>,
    },

    /// List audio input and output devices
    Devices,
}

impl Args {
    /// Default `env_logger` filter; `RUST_LOG` still wins.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_overrides() {
        let args = Args::try_parse_from([
            "voice-broadcast",
            "stream",
            "--server",
            "http://host:8000",
            "--broadcast",
            "abc",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Stream {
                server: Some("http://host:8000".into()),
                broadcast: Some("abc".into()),
            }
        );
        assert_eq!(args.log_filter(), "info");
    }

    #[test]
    fn parses_play_with_global_flags() {
        let args = Args::try_parse_from([
            "voice-broadcast",
            "play",
            "clip.pcm",
            "--chunk-bytes",
            "4410",
            "--config",
            "/tmp/s.toml",
            "-vv",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Play {
                file: PathBuf::from("clip.pcm"),
                chunk_bytes: Some(4410),
            }
        );
        assert_eq!(args.config, Some(PathBuf::from("/tmp/s.toml")));
        assert_eq!(args.log_filter(), "trace");
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Args::try_parse_from(["voice-broadcast"]).is_err());
    }
}
