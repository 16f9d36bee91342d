use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("Unknown option: --{0}")]
    UnknownOption(String),

    #[error("Invalid value for --{key}: {value:?} (expected {expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("Missing required option: --{0}")]
    MissingRequired(String),

    #[error("Malformed option argument: {0:?}")]
    Malformed(String),

    #[error("-@ is not allowed inside a -@ file")]
    NestedInclude,

    #[error("Cannot read option file {path}: {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
}

/// Value type of a declared option, for help output and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Int,
    Float,
    Str,
    File,
}

impl OptionKind {
    fn label(self) -> &'static str {
        match self {
            OptionKind::Bool => "BOOL",
            OptionKind::Int => "INT",
            OptionKind::Float => "FLOAT",
            OptionKind::Str => "STR",
            OptionKind::File => "FILE",
        }
    }
}

/// One declared option of a method, model or noise plugin.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub default: Option<&'static str>,
    pub description: &'static str,
}

/// Render an option table the way `--help` prints it.
pub fn format_option_table(title: &str, specs: &[OptionSpec]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}:", title);
    for spec in specs {
        let default = spec
            .default
            .map(|d| format!(" [default: {}]", d))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  --{}=<{}>  {}{}",
            spec.name,
            spec.kind.label(),
            spec.description,
            default
        );
    }
    out
}

/// Ordered key=value option map assembled from the command line and any
/// option files. Later CLI entries win over file entries; the first
/// occurrence of a key on the command line wins over later ones.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    map: BTreeMap<String, String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.map.entry(key.to_string()).or_insert_with(|| value.to_string());
    }

    /// Force a value regardless of whether the key is already present.
    pub fn override_value(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|k| k.as_str())
    }

    /// Parse loose `--key=value` / `--key` arguments (the ones the CLI layer
    /// did not claim) into the map.
    pub fn parse_args(&mut self, args: &[String]) -> Result<(), OptionsError> {
        for arg in args {
            let body = arg
                .strip_prefix("--")
                .ok_or_else(|| OptionsError::Malformed(arg.clone()))?;
            if body.is_empty() {
                return Err(OptionsError::Malformed(arg.clone()));
            }
            match body.split_once('=') {
                Some((key, value)) => self.insert(key, value),
                None => self.insert(body, "true"),
            }
        }
        Ok(())
    }

    /// Merge a `-f` parameter file: one `--key=value` per line, `#` comments,
    /// surrounding whitespace stripped, blank lines ignored.
    pub fn merge_param_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), OptionsError> {
        let text = std::fs::read_to_string(&path).map_err(|source| OptionsError::FileRead {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let mut args = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            args.push(line.to_string());
        }
        self.parse_args(&args)
    }

    /// Merge a legacy `-@` file: whitespace-separated `--key=value` tokens,
    /// no comments, nested `-@` forbidden.
    pub fn merge_legacy_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), OptionsError> {
        let text = std::fs::read_to_string(&path).map_err(|source| OptionsError::FileRead {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let mut args = Vec::new();
        for token in text.split_whitespace() {
            if token == "-@" {
                return Err(OptionsError::NestedInclude);
            }
            args.push(token.to_string());
        }
        self.parse_args(&args)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|v| v.as_str())
    }

    pub fn get_str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or(default).to_string()
    }

    pub fn require_str(&self, key: &str) -> Result<&str, OptionsError> {
        self.get_str(key)
            .ok_or_else(|| OptionsError::MissingRequired(key.to_string()))
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, OptionsError> {
        match self.map.get(key) {
            None => Ok(None),
            Some(v) => v.parse::<f64>().map(Some).map_err(|_| OptionsError::InvalidValue {
                key: key.to_string(),
                value: v.clone(),
                expected: "a floating-point number",
            }),
        }
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> Result<f64, OptionsError> {
        Ok(self.get_f64(key)?.unwrap_or(default))
    }

    pub fn get_usize(&self, key: &str) -> Result<Option<usize>, OptionsError> {
        match self.map.get(key) {
            None => Ok(None),
            Some(v) => v.parse::<usize>().map(Some).map_err(|_| OptionsError::InvalidValue {
                key: key.to_string(),
                value: v.clone(),
                expected: "a non-negative integer",
            }),
        }
    }

    pub fn get_usize_or(&self, key: &str, default: usize) -> Result<usize, OptionsError> {
        Ok(self.get_usize(key)?.unwrap_or(default))
    }

    /// Boolean options: bare `--key` parses as true; otherwise the value must
    /// be literal `true` or `false`. Absent keys are false.
    pub fn get_bool(&self, key: &str) -> Result<bool, OptionsError> {
        match self.map.get(key) {
            None => Ok(false),
            Some(v) if v == "true" => Ok(true),
            Some(v) if v == "false" => Ok(false),
            Some(v) => Err(OptionsError::InvalidValue {
                key: key.to_string(),
                value: v.clone(),
                expected: "true or false",
            }),
        }
    }

    /// Reject keys not declared by any active plugin. `prefixes` covers
    /// per-parameter key families such as `prior-mean-<param>`.
    pub fn check_known(
        &self,
        spec_tables: &[&[OptionSpec]],
        prefixes: &[&str],
    ) -> Result<(), OptionsError> {
        'keys: for key in self.keys() {
            for table in spec_tables {
                if table.iter().any(|s| s.name == key) {
                    continue 'keys;
                }
            }
            if prefixes.iter().any(|p| key.starts_with(p)) {
                continue;
            }
            return Err(OptionsError::UnknownOption(key.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let mut opts = RunOptions::new();
        opts.parse_args(&["--model=poly".into(), "--overwrite".into()]).unwrap();
        assert_eq!(opts.get_str("model"), Some("poly"));
        assert!(opts.get_bool("overwrite").unwrap());
        assert!(!opts.get_bool("absent").unwrap());
    }

    #[test]
    fn test_malformed_arg_rejected() {
        let mut opts = RunOptions::new();
        assert!(opts.parse_args(&["degree=2".into()]).is_err());
    }

    #[test]
    fn test_cli_wins_over_file() {
        let dir = std::env::temp_dir().join(format!("fabber_opts_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("params.txt");
        std::fs::write(&path, "# comment\n\n  --maxits=50  \n--degree=3\n").unwrap();

        let mut opts = RunOptions::new();
        opts.parse_args(&["--maxits=10".into()]).unwrap();
        opts.merge_param_file(&path).unwrap();
        assert_eq!(opts.get_usize("maxits").unwrap(), Some(10));
        assert_eq!(opts.get_usize("degree").unwrap(), Some(3));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_legacy_file_rejects_nested_include() {
        let dir = std::env::temp_dir().join(format!("fabber_legacy_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("legacy.txt");
        std::fs::write(&path, "--maxits=5 -@ other.txt").unwrap();

        let mut opts = RunOptions::new();
        assert!(matches!(
            opts.merge_legacy_file(&path),
            Err(OptionsError::NestedInclude)
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_typed_getters() {
        let mut opts = RunOptions::new();
        opts.parse_args(&["--fchange=0.01".into(), "--maxits=abc".into()]).unwrap();
        assert_eq!(opts.get_f64("fchange").unwrap(), Some(0.01));
        assert!(opts.get_usize("maxits").is_err());
        assert!(opts.require_str("data").is_err());
    }

    #[test]
    fn test_check_known() {
        const SPECS: &[OptionSpec] = &[OptionSpec {
            name: "maxits",
            kind: OptionKind::Int,
            default: Some("25"),
            description: "maximum iterations",
        }];
        let mut opts = RunOptions::new();
        opts.parse_args(&["--maxits=5".into(), "--prior-mean-c0=1.0".into()]).unwrap();
        assert!(opts.check_known(&[SPECS], &["prior-mean-"]).is_ok());

        opts.parse_args(&["--bogus=1".into()]).unwrap();
        assert!(matches!(
            opts.check_known(&[SPECS], &["prior-mean-"]),
            Err(OptionsError::UnknownOption(k)) if k == "bogus"
        ));
    }
}
