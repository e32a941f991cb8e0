use anyhow::ensure;
use area_locator::MatcherConfig;
use clap::Parser;
use render_pipeline::job::DEFAULT_COMMAND_TEMPLATE;
use render_pipeline::{CpuPool, DEFAULT_PREVIEW_MAX_DIMENSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// `poster_service` - turns map photos into print-ready city posters.
///
/// Locates an uploaded area photo inside a city's reference map, queues the
/// poster render and drops the finished artifacts into a per-requester outbox.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Address the HTTP facade (including `/metrics`) listens on.
    #[arg(long, env = "POSTER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Root of the static assets: `img/`, `geojson/` and `shp/`.
    #[arg(long, env = "POSTER_FILES_ROOT", default_value = "files")]
    pub files_root: PathBuf,

    /// Scratch directory for derived area geometries.
    #[arg(long, env = "POSTER_TMP_DIR", default_value = "tmp")]
    pub tmp_dir: PathBuf,

    /// Directory the renderer writes posters and previews into.
    #[arg(long, env = "POSTER_WORK_DIR", default_value = "work")]
    pub work_dir: PathBuf,

    /// Per-requester mailboxes receiving delivered posters.
    #[arg(long, env = "POSTER_OUTBOX_DIR", default_value = "outbox")]
    pub outbox_dir: PathBuf,

    /// Shell command rendering one poster. Placeholders: `{shp}`, `{geojson}`,
    /// `{colors}`, `{prefix}`. The output must be `{prefix}_{colors}.png`.
    #[arg(long, env = "POSTER_RENDER_COMMAND", default_value = DEFAULT_COMMAND_TEMPLATE)]
    pub render_command: String,

    /// Threads in the CPU pool used for matching and previews.
    #[arg(long, env = "POSTER_CPU_THREADS", default_value_t = CpuPool::DEFAULT_THREADS)]
    pub cpu_threads: usize,

    /// Longest side of the preview sent ahead of the full poster.
    #[arg(long, env = "POSTER_PREVIEW_MAX_DIMENSION", default_value_t = DEFAULT_PREVIEW_MAX_DIMENSION)]
    pub preview_max_dimension: u32,

    /// Largest accepted area photo upload, in bytes.
    #[arg(long, env = "POSTER_MAX_UPLOAD_BYTES", default_value_t = 20 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    #[arg(long, env = "POSTER_SCALE_MIN", default_value_t = 0.2)]
    pub scale_min: f64,

    #[arg(long, env = "POSTER_SCALE_MAX", default_value_t = 1.0)]
    pub scale_max: f64,

    /// Number of scales tried between `scale_min` and `scale_max`.
    #[arg(long, env = "POSTER_SCALE_STEPS", default_value_t = 50)]
    pub scale_steps: usize,

    /// Matches must score strictly above this normalized correlation.
    #[arg(long, env = "POSTER_MIN_SCORE", default_value_t = 0.2)]
    pub min_score: f64,

    /// Seconds a located area waits for a render job before its geometry is discarded.
    #[arg(long, env = "POSTER_AREA_TTL_SECS", default_value_t = 1800)]
    pub area_ttl_secs: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.scale_min > 0.0 && self.scale_min <= self.scale_max,
            "scale range must satisfy 0 < scale_min <= scale_max (got {}..{})",
            self.scale_min,
            self.scale_max
        );
        ensure!(self.scale_steps >= 1, "scale_steps must be at least 1");
        ensure!(self.cpu_threads >= 1, "cpu_threads must be at least 1");
        ensure!(self.preview_max_dimension >= 1, "preview_max_dimension must be at least 1");
        ensure!(self.area_ttl_secs >= 1, "area_ttl_secs must be at least 1");
        Ok(())
    }

    pub fn area_ttl(&self) -> Duration {
        Duration::from_secs(self.area_ttl_secs)
    }

    pub fn matcher(&self) -> MatcherConfig {
        MatcherConfig {
            scale_min: self.scale_min,
            scale_max: self.scale_max,
            scale_steps: self.scale_steps,
            min_score: self.min_score,
            ..MatcherConfig::default()
        }
    }
}
