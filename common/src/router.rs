//! Maps partition keys to output file locations.

use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("valid unsafe-char pattern"));

// Key components are drawn from `[\w\-~.:]`. A `course-v1` key may carry
// `+branch@` and `+version@` parts, which do not name a different course.
static COURSE_V1_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^course-v1:([\w\-~.:]+)\+([\w\-~.:]+)\+([\w\-~.:]+)(?:\+branch@[\w\-~.:]+)?(?:\+version@[A-Fa-f0-9]{24})?$",
    )
    .expect("valid course key pattern")
});

static SLASH_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([\w\-~.:]+)/([\w\-~.:]+)/([\w\-~.:]+)$").expect("valid slash key pattern")
});

pub fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Course keys (`course-v1:ORG+COURSE+RUN` or `ORG/COURSE/RUN`) become
/// `ORG{sub}COURSE{sub}RUN`; branch and version parts are dropped. Keys that
/// do not parse as course keys are left whole. Any remaining character
/// outside `[A-Za-z0-9_.-]` is replaced by `substitute`.
///
/// Keys differing only in unsafe characters collide, e.g. `a:b` and `a;b`.
pub fn sanitize(key: &str, substitute: char) -> String {
    let sub = substitute.to_string();
    let joined = COURSE_V1_KEY
        .captures(key)
        .or_else(|| SLASH_KEY.captures(key))
        .map(|caps| [&caps[1], &caps[2], &caps[3]].join(sub.as_str()));
    let name = joined.as_deref().unwrap_or(key);
    UNSAFE_CHARS
        .replace_all(name, regex::NoExpand(sub.as_str()))
        .into_owned()
}

#[derive(Debug, Clone)]
pub struct OutputRouter {
    root: PathBuf,
    entity_name: String,
    suffix: Option<String>,
    substitute: char,
}

impl OutputRouter {
    pub fn new(
        root: impl Into<PathBuf>,
        entity_name: impl Into<String>,
        suffix: Option<String>,
        substitute: char,
    ) -> Result<Self> {
        if !is_safe_char(substitute) {
            return Err(Error::Config(format!(
                "substitute {substitute:?} is not a filename-safe character"
            )));
        }
        let entity_name = entity_name.into();
        let suffix = suffix.filter(|s| !s.is_empty());
        for part in std::iter::once(&entity_name).chain(suffix.iter()) {
            if part.contains(['/', '\\']) {
                return Err(Error::Config(format!(
                    "{part:?} would escape the output root"
                )));
            }
        }
        Ok(Self {
            root: root.into(),
            entity_name,
            suffix,
            substitute,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name_for(&self, key: &str) -> String {
        format!(
            "{}-{}-{}analytics.sql",
            sanitize(key, self.substitute),
            self.entity_name,
            self.suffix
                .as_ref()
                .map(|s| format!("{s}-"))
                .unwrap_or_default()
        )
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(self.file_name_for(key))
    }
}
