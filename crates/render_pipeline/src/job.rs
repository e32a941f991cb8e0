use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

/// Renderer invocation used when no template is configured.
pub const DEFAULT_COMMAND_TEMPLATE: &str =
    "mapoc poster create --shp_path {shp} --geojson {geojson} --colors {colors} --output_prefix {prefix}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of whoever asked for the poster; artifacts are delivered back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequesterId(pub i64);

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Queued -> Running -> Delivering -> Done`, or `Queued -> Running -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Delivering,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Delivering => "delivering",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One invocation of the poster renderer.
#[derive(Debug, Clone)]
pub struct RenderJob {
    /// Complete shell command line.
    pub command: String,
    pub geometry_path: PathBuf,
    /// File the renderer is expected to produce.
    pub output_path: PathBuf,
    pub color: String,
    /// Remove `geometry_path` once the job finishes, whatever the outcome.
    pub delete_geometry: bool,
    pub requester: RequesterId,
    pub caption: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Inputs for [`CommandTemplate::job`].
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub shapefile: PathBuf,
    pub geometry: PathBuf,
    pub color: String,
    pub prefix: PathBuf,
    pub requester: RequesterId,
    pub caption: String,
    pub delete_geometry: bool,
}

/// Shell command template with `{shp}`, `{geojson}`, `{colors}` and `{prefix}`
/// placeholders. Substituted values are single-quoted.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    template: String,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TEMPLATE)
    }
}

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// The renderer names its output `{prefix}_{color}.png`.
    pub fn output_path(prefix: &Path, color: &str) -> PathBuf {
        let mut name = prefix.as_os_str().to_owned();
        name.push(format!("_{color}.png"));
        PathBuf::from(name)
    }

    pub fn command(&self, shapefile: &Path, geometry: &Path, color: &str, prefix: &Path) -> String {
        let mut out = String::with_capacity(self.template.len() + 128);
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let Some(end) = tail.find('}') else {
                out.push_str(tail);
                return out;
            };

            let value: Option<Cow<'_, str>> = match &tail[1..end] {
                "shp" => Some(shapefile.to_string_lossy()),
                "geojson" => Some(geometry.to_string_lossy()),
                "colors" => Some(Cow::Borrowed(color)),
                "prefix" => Some(prefix.to_string_lossy()),
                _ => None,
            };
            match value {
                Some(v) => out.push_str(&shell_quote(&v)),
                None => out.push_str(&tail[..=end]),
            }
            rest = &tail[end + 1..];
        }

        out.push_str(rest);
        out
    }

    pub fn job(&self, request: RenderRequest) -> RenderJob {
        RenderJob {
            command: self.command(
                &request.shapefile,
                &request.geometry,
                &request.color,
                &request.prefix,
            ),
            output_path: Self::output_path(&request.prefix, &request.color),
            geometry_path: request.geometry,
            color: request.color,
            delete_geometry: request.delete_geometry,
            requester: request.requester,
            caption: request.caption,
            enqueued_at: Utc::now(),
        }
    }
}

/// `<work_dir>/<requester>_<unix seconds>_<city without whitespace>`.
pub fn output_prefix(work_dir: &Path, requester: RequesterId, city: &str, now: DateTime<Utc>) -> PathBuf {
    let city: String = city.split_whitespace().collect();
    work_dir.join(format!("{requester}_{}_{city}", now.timestamp()))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
