use crate::work::{parse_number, ParseError, Range};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// Processing mode understood by sqct for rotations by `2πk/n`
pub const UNIFORM: &str = "UNIFORM";

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Failed to read request file: {0}")]
    Read(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

const SECTIONS: [&str; 8] = ["mode", "output", "min gates", "max gates", "n", "k1", "k2", "kstep"];

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GateBounds {
    #[serde(default)]
    pub min: u64,
    #[serde(default = "default_max_gates")]
    pub max: u64,
}

impl Default for GateBounds {
    fn default() -> Self {
        Self {
            min: 0,
            max: default_max_gates(),
        }
    }
}

fn default_max_gates() -> u64 {
    100
}

/// The line oriented request file handed to `sqct -G`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFile {
    pub output: PathBuf,
    pub gates: GateBounds,
    pub range: Range,
}

impl fmt::Display for RequestFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Request approximation of R_z rotations by angles of the form $2\\pi k/n$ for k in the interval [k1,k2)")?;
        writeln!(f, "{UNIFORM}")?;
        writeln!(f, "#Filename with approximation results")?;
        writeln!(f, "{}", self.output.display())?;
        writeln!(f, "#Minimal number of T gates to use for approximation")?;
        writeln!(f, "{}", self.gates.min)?;
        writeln!(f, "#Maximal number of T gates to use for approximation")?;
        writeln!(f, "{}", self.gates.max)?;
        writeln!(f, "#n\n{}", self.range.n)?;
        writeln!(f, "#k1\n{}", self.range.kmin)?;
        writeln!(f, "#k2\n{}", self.range.kmax)?;
        writeln!(f, "#kstep\n{}", self.range.step)
    }
}

impl FromStr for RequestFile {
    type Err = ParseError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let mut values = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'));
        let mut sections = SECTIONS.iter();
        let mut next = || {
            let section = *sections.next().unwrap_or(&"trailing");
            values
                .next()
                .map(|value| (section, value))
                .ok_or(ParseError::MissingSection(section))
        };
        let number = |(section, value): (&'static str, &str)| {
            parse_number(value).ok_or_else(|| ParseError::InvalidSection {
                section,
                value: value.to_owned(),
            })
        };

        let (_, mode) = next()?;
        if !mode.eq_ignore_ascii_case(UNIFORM) {
            return Err(ParseError::UnsupportedMode(mode.to_owned()));
        }
        let (_, output) = next()?;
        let gates = GateBounds {
            min: number(next()?)?,
            max: number(next()?)?,
        };
        let n = number(next()?)?;
        let kmin = number(next()?)?;
        let kmax = number(next()?)?;
        let step = number(next()?)?;

        if step == 0 {
            return Err(ParseError::InvalidSection {
                section: "kstep",
                value: "0".to_owned(),
            });
        }

        Ok(Self {
            output: PathBuf::from(output),
            gates,
            range: Range::new(n, kmin, kmax, step),
        })
    }
}

/// Everything a scheduler needs to run one range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub request_path: PathBuf,
    pub request: RequestFile,
}

impl JobRequest {
    pub fn new(
        range: Range,
        gates: GateBounds,
        single: bool,
        requests_dir: &Path,
        output_dir: &Path,
    ) -> Self {
        let stem = range.stem(single);

        Self {
            name: format!("sqct_{stem}"),
            request_path: requests_dir.join(format!("config_{stem}.txt")),
            request: RequestFile {
                output: output_dir.join(range.output_name(single)),
                gates,
                range,
            },
        }
    }

    /// Rebuild a job from a request file that already exists on disk
    pub fn from_file(path: &Path) -> Result<Self, RequestError> {
        let content = fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().replacen("config_", "sqct_", 1))
            .unwrap_or_else(|| "sqct".to_owned());

        Ok(Self {
            name,
            request_path: path.to_path_buf(),
            request: content.parse()?,
        })
    }

    pub fn range(&self) -> &Range {
        &self.request.range
    }

    pub fn output(&self) -> &Path {
        &self.request.output
    }

    pub fn write(&self) -> io::Result<()> {
        fs::write(&self.request_path, self.request.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobRequest {
        JobRequest::new(
            Range::new(8, 1, 8, 2),
            GateBounds::default(),
            false,
            Path::new("configs"),
            Path::new("out"),
        )
    }

    #[test]
    fn names_follow_range() {
        let job = job();

        assert_eq!(job.name, "sqct_8_1_8");
        assert_eq!(job.request_path, PathBuf::from("configs/config_8_1_8.txt"));
        assert_eq!(job.output(), Path::new("out/uni_8_1_8.txt"));

        let single = JobRequest::new(
            Range::new(8, 3, 5, 2),
            GateBounds::default(),
            true,
            Path::new("configs"),
            Path::new("out"),
        );
        assert_eq!(single.name, "sqct_8_3");
        assert_eq!(single.output(), Path::new("out/uni_8_3.txt"));
    }

    #[test]
    fn request_layout() {
        let rendered = job().request.to_string();
        let values: Vec<&str> = rendered
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect();

        assert_eq!(
            values,
            vec!["UNIFORM", "out/uni_8_1_8.txt", "0", "100", "8", "1", "8", "2"]
        );
        assert_eq!(rendered.parse::<RequestFile>(), Ok(job().request));
    }

    #[test]
    fn malformed_requests() {
        assert_eq!(
            "UNIFORM\nout/a.txt\n0\n100\n8\n1\n".parse::<RequestFile>(),
            Err(ParseError::MissingSection("k2"))
        );
        assert_eq!(
            "EXACT\nout/a.txt\n0\n100\n8\n1\n9\n2".parse::<RequestFile>(),
            Err(ParseError::UnsupportedMode("EXACT".to_owned()))
        );
        assert_eq!(
            "UNIFORM\nout/a.txt\n0\nmany\n8\n1\n9\n2".parse::<RequestFile>(),
            Err(ParseError::InvalidSection {
                section: "max gates",
                value: "many".to_owned()
            })
        );
    }

    #[test]
    fn reads_request_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobRequest::new(
            Range::new(8, 1, 8, 2),
            GateBounds::default(),
            false,
            dir.path(),
            Path::new("out"),
        );
        job.write().unwrap();

        let loaded = JobRequest::from_file(&job.request_path).unwrap();
        assert_eq!(loaded, job);
    }
}
