use std::convert::TryFrom;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};

use crate::checksum::ChecksumSpec;
use crate::download::{
    DownloadKind, ExistingFilePolicy, OrchestratorConfig, PeerSettings, SelectableItem,
    DEFAULT_MAX_CONCURRENT,
};
use crate::progress::ProgressMode;
use crate::source::{parse_link, SourceDescriptor};
use crate::util::parse_bandwidth_limit;

#[derive(Parser, Debug, Clone)]
#[command(name = "mdown", author, version, about = "Download manager for HTTP, magnet and ed2k links", long_about = None)]
pub struct Cli {
    /// Links to download (http(s)://, magnet:?, ed2k://)
    #[arg(value_name = "link", required = true)]
    pub links: Vec<String>,

    /// Destination directory
    #[arg(short, long, value_name = "dir")]
    pub output: Option<PathBuf>,

    /// Maximum number of simultaneous downloads
    #[arg(
        short = 'j',
        long = "max-concurrent",
        value_name = "int",
        default_value_t = DEFAULT_MAX_CONCURRENT
    )]
    pub max_concurrent: usize,

    /// Progress refresh interval in milliseconds
    #[arg(long = "tick-ms", value_name = "ms", default_value_t = 500)]
    pub tick_ms: u64,

    /// Override the download kind inferred from each link
    #[arg(long = "kind", value_enum, value_name = "kind")]
    pub kind: Option<DownloadKind>,

    /// Abort an HTTP transfer after this many seconds without data
    #[arg(long = "timeout", value_name = "secs")]
    pub timeout: Option<u64>,

    /// Limit total HTTP bandwidth (e.g. 50M/s)
    #[arg(long = "bandwidth-limit", value_name = "rate")]
    pub bandwidth_limit: Option<String>,

    /// Verify SHA256 checksum (hex string or file path); single link only
    #[arg(long = "sha256", value_name = "hex|path")]
    pub sha256: Option<String>,

    /// Continue into existing files instead of picking a new name
    #[arg(long = "resume", action = ArgAction::SetTrue)]
    pub resume: bool,

    /// Size assumed for magnet links (e.g. 16MiB)
    #[arg(long = "peer-size", value_name = "size")]
    pub peer_size: Option<String>,

    /// Quiet mode
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Stream progress as newline-delimited JSON
    #[arg(long = "json", action = ArgAction::SetTrue)]
    pub json: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// Everything `main` needs to run one batch.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub orchestrator: OrchestratorConfig,
    pub items: Vec<SelectableItem>,
    pub output_dir: PathBuf,
    pub existing_files: ExistingFilePolicy,
    pub progress: ProgressMode,
}

impl TryFrom<Cli> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        if cli.links.is_empty() {
            return Err(anyhow!("at least one link is required"));
        }
        if cli.max_concurrent == 0 {
            return Err(anyhow!("--max-concurrent must be at least 1"));
        }
        if cli.tick_ms == 0 {
            return Err(anyhow!("--tick-ms must be at least 1"));
        }
        if cli.sha256.is_some() && cli.links.len() != 1 {
            return Err(anyhow!("--sha256 can only be used with a single link"));
        }

        let checksum = if let Some(value) = cli.sha256.as_deref() {
            Some(ChecksumSpec::from_input(value)?)
        } else {
            None
        };

        let mut items = Vec::with_capacity(cli.links.len());
        for link in &cli.links {
            let source = parse_link(link).with_context(|| format!("cannot use link {link}"))?;
            let mut item = SelectableItem::from_source(source);
            if let Some(kind) = cli.kind {
                if !kind.accepts(&item.source) {
                    return Err(anyhow!(
                        "--kind {kind} does not apply to {} link {link}",
                        item.source.scheme()
                    ));
                }
                item = item.with_kind(kind);
            }
            if let Some(spec) = checksum.clone() {
                if !matches!(item.source, SourceDescriptor::Http { .. }) {
                    return Err(anyhow!("--sha256 is only supported for http(s) links"));
                }
                item = item.with_checksum(spec);
            }
            items.push(item);
        }

        let bandwidth_limit = if let Some(limit) = cli.bandwidth_limit.as_deref() {
            Some(parse_bandwidth_limit(limit)?)
        } else {
            None
        };

        let mut peer = PeerSettings::default();
        if let Some(size) = cli.peer_size.as_deref() {
            peer.default_size =
                parse_bandwidth_limit(size).with_context(|| format!("invalid --peer-size {size}"))?;
        }

        let progress = if cli.json {
            ProgressMode::Json
        } else if cli.quiet {
            ProgressMode::Quiet
        } else {
            ProgressMode::Text
        };

        Ok(AppConfig {
            orchestrator: OrchestratorConfig {
                max_concurrent: cli.max_concurrent,
                tick: Duration::from_millis(cli.tick_ms),
                http_timeout: cli.timeout.map(Duration::from_secs),
                bandwidth_limit,
                peer,
            },
            items,
            output_dir: cli.output.unwrap_or_else(|| PathBuf::from(".")),
            existing_files: if cli.resume {
                ExistingFilePolicy::Resume
            } else {
                ExistingFilePolicy::Rename
            },
            progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGNET: &str = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=linux.iso";

    fn config(args: &[&str]) -> Result<AppConfig> {
        let mut argv = vec!["mdown"];
        argv.extend_from_slice(args);
        AppConfig::try_from(Cli::try_parse_from(argv).expect("cli parse"))
    }

    #[test]
    fn progress_mode_defaults_to_text() {
        let config = config(&["https://example.com/file"]).expect("config");
        assert_eq!(config.progress, ProgressMode::Text);
        assert_eq!(config.orchestrator.max_concurrent, 2);
        assert_eq!(config.orchestrator.tick, Duration::from_millis(500));
        assert_eq!(config.output_dir, PathBuf::from("."));
        assert_eq!(config.existing_files, ExistingFilePolicy::Rename);
    }

    #[test]
    fn progress_mode_respects_quiet() {
        let config = config(&["https://example.com/file", "--quiet"]).expect("config");
        assert_eq!(config.progress, ProgressMode::Quiet);
    }

    #[test]
    fn progress_mode_prefers_json_flag() {
        let config = config(&["https://example.com/file", "--quiet", "--json"]).expect("config");
        assert_eq!(config.progress, ProgressMode::Json);
    }

    #[test]
    fn kinds_follow_link_families() {
        let config = config(&[
            "https://example.com/a.mp4",
            MAGNET,
            "ed2k://|file|a.avi|10|0123456789abcdef0123456789abcdef|/",
        ])
        .expect("config");
        let kinds: Vec<DownloadKind> = config.items.iter().map(|item| item.kind).collect();
        assert_eq!(
            kinds,
            vec![DownloadKind::Video, DownloadKind::Torrent, DownloadKind::Ed2k]
        );
        assert_eq!(config.items[1].suggested_filename, "linux.iso");
        assert_eq!(config.items[2].estimated_size, Some(10));
    }

    #[test]
    fn kind_override_must_fit_the_link() {
        let config = config(&["https://example.com/a.srt", "--kind", "subtitle"]).expect("config");
        assert_eq!(config.items[0].kind, DownloadKind::Subtitle);

        let err = self::config(&[MAGNET, "--kind", "audio"]).unwrap_err();
        assert!(err.to_string().contains("does not apply"));
    }

    #[test]
    fn sha256_requires_a_single_http_link() {
        let hex = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        let err = config(&["https://a.example/x", "https://b.example/y", "--sha256", hex])
            .unwrap_err();
        assert!(err.to_string().contains("single link"));

        let err = config(&[MAGNET, "--sha256", hex]).unwrap_err();
        assert!(err.to_string().contains("http"));

        let config = config(&["https://a.example/x", "--sha256", hex]).expect("config");
        assert!(config.items[0].checksum.is_some());
    }

    #[test]
    fn limits_and_sizes_are_parsed() {
        let config = config(&[
            MAGNET,
            "--bandwidth-limit",
            "2MiB/s",
            "--peer-size",
            "1MiB",
            "--timeout",
            "30",
            "-j",
            "4",
            "--resume",
        ])
        .expect("config");
        assert_eq!(config.orchestrator.bandwidth_limit, Some(2 << 20));
        assert_eq!(config.orchestrator.peer.default_size, 1 << 20);
        assert_eq!(
            config.orchestrator.http_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.orchestrator.max_concurrent, 4);
        assert_eq!(config.existing_files, ExistingFilePolicy::Resume);
    }

    #[test]
    fn unsupported_links_are_rejected() {
        let err = config(&["ftp://example.com/file"]).unwrap_err();
        assert!(format!("{err:#}").contains("unsupported"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(config(&["https://example.com/file", "-j", "0"]).is_err());
    }
}
