// This module holds the compilation policy handed to the compiler driver. CompilerFilter is the
// ladder of compilation levels from assume-verified up to everything, with helpers telling
// whether a level verifies, produces native code, or restricts itself to profiled methods.
// BackendKind names the backend strategy. ProfileData is the set of hot methods read from a
// simple text profile. CompilerConfigBuilder validates caller supplied fields (thread count and
// filter name) and produces an immutable CompilerConfiguration together with an empty
// VerificationResults registry that the driver fills in while it verifies methods. Building is
// free of side effects; loading a profile from disk is a separate step.

//! Compiler configuration and companion metadata.

use super::error::{HarnessError, HarnessResult};
use crate::runtime::MethodId;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Compilation level, ordered from least to most code produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompilerFilter {
    AssumeVerified,
    Extract,
    Verify,
    SpaceProfile,
    Space,
    SpeedProfile,
    Speed,
    EverythingProfile,
    Everything,
}

impl CompilerFilter {
    pub const DEFAULT: CompilerFilter = CompilerFilter::Speed;

    pub fn name(self) -> &'static str {
        match self {
            CompilerFilter::AssumeVerified => "assume-verified",
            CompilerFilter::Extract => "extract",
            CompilerFilter::Verify => "verify",
            CompilerFilter::SpaceProfile => "space-profile",
            CompilerFilter::Space => "space",
            CompilerFilter::SpeedProfile => "speed-profile",
            CompilerFilter::Speed => "speed",
            CompilerFilter::EverythingProfile => "everything-profile",
            CompilerFilter::Everything => "everything",
        }
    }

    pub fn is_verification_enabled(self) -> bool {
        self >= CompilerFilter::Verify
    }

    pub fn is_aot_compilation_enabled(self) -> bool {
        self >= CompilerFilter::SpaceProfile
    }

    pub fn depends_on_profile(self) -> bool {
        matches!(
            self,
            CompilerFilter::SpaceProfile
                | CompilerFilter::SpeedProfile
                | CompilerFilter::EverythingProfile
        )
    }
}

impl Default for CompilerFilter {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for CompilerFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompilerFilter {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let filter = match s.trim() {
            "" => return Err(HarnessError::configuration("compiler filter is empty")),
            "assume-verified" => CompilerFilter::AssumeVerified,
            "extract" => CompilerFilter::Extract,
            "verify" => CompilerFilter::Verify,
            "space-profile" => CompilerFilter::SpaceProfile,
            "space" => CompilerFilter::Space,
            "speed-profile" => CompilerFilter::SpeedProfile,
            "speed" => CompilerFilter::Speed,
            "everything-profile" => CompilerFilter::EverythingProfile,
            "everything" => CompilerFilter::Everything,
            other => {
                return Err(HarnessError::configuration(format!(
                    "unknown compiler filter `{other}`"
                )))
            }
        };
        Ok(filter)
    }
}

/// Backend strategy used by the compiler driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    Quick,
    #[default]
    Optimizing,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Quick => f.write_str("quick"),
            BackendKind::Optimizing => f.write_str("optimizing"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "quick" => Ok(BackendKind::Quick),
            "optimizing" => Ok(BackendKind::Optimizing),
            other => Err(HarnessError::configuration(format!(
                "unknown compiler backend `{other}`"
            ))),
        }
    }
}

/// Hot methods recorded in a profile.
///
/// The text format holds one method per line, `pkg.Class->name(signature)`.
/// Blank lines and lines starting with `#` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileData {
    hot_methods: HashSet<String>,
}

impl ProfileData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> HarnessResult<Self> {
        let mut profile = Self::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (class, method) = line.split_once("->").ok_or_else(|| {
                HarnessError::configuration(format!(
                    "profile line {}: expected `Class->name(signature)`, got `{line}`",
                    line_no + 1
                ))
            })?;
            let paren = method.find('(').ok_or_else(|| {
                HarnessError::configuration(format!(
                    "profile line {}: missing signature in `{line}`",
                    line_no + 1
                ))
            })?;
            if class.is_empty() || paren == 0 {
                return Err(HarnessError::configuration(format!(
                    "profile line {}: empty class or method name in `{line}`",
                    line_no + 1
                )));
            }
            profile.add_hot_method(class, &method[..paren], &method[paren..]);
        }
        Ok(profile)
    }

    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::configuration(format!(
                "cannot read profile {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&text)
    }

    pub fn add_hot_method(&mut self, class: &str, name: &str, signature: &str) {
        self.hot_methods.insert(Self::key(class, name, signature));
    }

    pub fn contains(&self, class: &str, name: &str, signature: &str) -> bool {
        self.hot_methods.contains(&Self::key(class, name, signature))
    }

    pub fn len(&self) -> usize {
        self.hot_methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hot_methods.is_empty()
    }

    fn key(class: &str, name: &str, signature: &str) -> String {
        format!("{class}->{name}{signature}")
    }
}

/// Immutable compilation policy.
#[derive(Debug, Clone)]
pub struct CompilerConfiguration {
    backend_kind: BackendKind,
    compiler_filter: CompilerFilter,
    thread_count: usize,
    allowed_classes: Option<HashSet<String>>,
    profile_data: Option<ProfileData>,
}

impl CompilerConfiguration {
    pub fn builder() -> CompilerConfigBuilder {
        CompilerConfigBuilder::new()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    pub fn compiler_filter(&self) -> CompilerFilter {
        self.compiler_filter
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn allowed_classes(&self) -> Option<&HashSet<String>> {
        self.allowed_classes.as_ref()
    }

    pub fn profile_data(&self) -> Option<&ProfileData> {
        self.profile_data.as_ref()
    }

    /// Whether methods of `class` may be compiled when a whole class is requested.
    pub fn is_class_allowed(&self, class: &str) -> bool {
        self.allowed_classes
            .as_ref()
            .map_or(true, |allowed| allowed.contains(class))
    }

    /// Whether the filter's profile requirement admits the method.
    pub fn is_profiled(&self, class: &str, name: &str, signature: &str) -> bool {
        if !self.compiler_filter.depends_on_profile() {
            return true;
        }
        self.profile_data
            .as_ref()
            .is_some_and(|profile| profile.contains(class, name, signature))
    }
}

/// Builder for [`CompilerConfiguration`].
#[derive(Debug, Clone)]
pub struct CompilerConfigBuilder {
    backend_kind: BackendKind,
    compiler_filter: String,
    thread_count: usize,
    allowed_classes: Option<HashSet<String>>,
    profile_data: Option<ProfileData>,
}

impl CompilerConfigBuilder {
    pub fn new() -> Self {
        Self {
            backend_kind: BackendKind::default(),
            compiler_filter: CompilerFilter::DEFAULT.name().to_string(),
            thread_count: 2,
            allowed_classes: None,
            profile_data: None,
        }
    }

    pub fn backend_kind(mut self, kind: BackendKind) -> Self {
        self.backend_kind = kind;
        self
    }

    pub fn compiler_filter(mut self, filter: impl Into<String>) -> Self {
        self.compiler_filter = filter.into();
        self
    }

    pub fn thread_count(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    pub fn allowed_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_classes = Some(classes.into_iter().map(Into::into).collect());
        self
    }

    pub fn profile_data(mut self, profile: ProfileData) -> Self {
        self.profile_data = Some(profile);
        self
    }

    /// Validate the fields and produce the configuration with an empty
    /// verification registry.
    pub fn build(self) -> HarnessResult<(CompilerConfiguration, VerificationResults)> {
        if self.thread_count == 0 {
            return Err(HarnessError::configuration("thread count must be at least 1"));
        }
        let compiler_filter = self.compiler_filter.parse::<CompilerFilter>()?;

        let configuration = CompilerConfiguration {
            backend_kind: self.backend_kind,
            compiler_filter,
            thread_count: self.thread_count,
            allowed_classes: self.allowed_classes,
            profile_data: self.profile_data,
        };
        Ok((configuration, VerificationResults::new()))
    }
}

impl Default for CompilerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum VerificationOutcome {
    Verified,
    Rejected(String),
}

/// Per-method verification outcomes recorded by the driver.
#[derive(Debug, Default)]
pub struct VerificationResults {
    outcomes: Mutex<HashMap<MethodId, VerificationOutcome>>,
}

impl VerificationResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_verified(&self, method: MethodId) {
        self.outcomes
            .lock()
            .insert(method, VerificationOutcome::Verified);
    }

    pub fn record_rejected(&self, method: MethodId, reason: impl Into<String>) {
        self.outcomes
            .lock()
            .insert(method, VerificationOutcome::Rejected(reason.into()));
    }

    pub fn is_verified(&self, method: MethodId) -> bool {
        matches!(
            self.outcomes.lock().get(&method),
            Some(VerificationOutcome::Verified)
        )
    }

    pub fn is_rejected(&self, method: MethodId) -> bool {
        self.rejection_reason(method).is_some()
    }

    pub fn rejection_reason(&self, method: MethodId) -> Option<String> {
        match self.outcomes.lock().get(&method) {
            Some(VerificationOutcome::Rejected(reason)) => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn rejected_count(&self) -> usize {
        self.outcomes
            .lock()
            .values()
            .filter(|outcome| matches!(outcome, VerificationOutcome::Rejected(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let (config, results) = CompilerConfiguration::builder().build().unwrap();
        assert_eq!(config.backend_kind(), BackendKind::Optimizing);
        assert_eq!(config.compiler_filter(), CompilerFilter::Speed);
        assert_eq!(config.thread_count(), 2);
        assert!(config.is_class_allowed("anything.At.All"));
        assert_eq!(results.rejected_count(), 0);
    }

    #[test]
    fn test_invalid_thread_count() {
        let err = CompilerConfigBuilder::new().thread_count(0).build().unwrap_err();
        assert!(matches!(err, HarnessError::Configuration { .. }));
    }

    #[test]
    fn test_invalid_filter() {
        assert!(CompilerConfigBuilder::new().compiler_filter("").build().is_err());
        assert!(CompilerConfigBuilder::new()
            .compiler_filter("quicken-harder")
            .build()
            .is_err());
        let (config, _) = CompilerConfigBuilder::new()
            .compiler_filter("verify")
            .build()
            .unwrap();
        assert_eq!(config.compiler_filter(), CompilerFilter::Verify);
    }

    #[test]
    fn test_filter_levels() {
        assert!(!CompilerFilter::Extract.is_verification_enabled());
        assert!(CompilerFilter::Verify.is_verification_enabled());
        assert!(!CompilerFilter::Verify.is_aot_compilation_enabled());
        assert!(CompilerFilter::SpaceProfile.is_aot_compilation_enabled());
        assert!(CompilerFilter::SpeedProfile.depends_on_profile());
        assert!(!CompilerFilter::Everything.depends_on_profile());
        for filter in [CompilerFilter::AssumeVerified, CompilerFilter::EverythingProfile] {
            assert_eq!(filter.name().parse::<CompilerFilter>().unwrap(), filter);
        }
    }

    #[test]
    fn test_allowed_classes() {
        let (config, _) = CompilerConfigBuilder::new()
            .allowed_classes(["demo.Main"])
            .build()
            .unwrap();
        assert!(config.is_class_allowed("demo.Main"));
        assert!(!config.is_class_allowed("demo.Other"));
    }

    #[test]
    fn test_profile_parsing() {
        let profile = ProfileData::parse(
            "# hot methods\n\
             demo.Main->answer()J\n\
             \n\
             demo.Main->add(JJ)J\n",
        )
        .unwrap();
        assert_eq!(profile.len(), 2);
        assert!(profile.contains("demo.Main", "add", "(JJ)J"));
        assert!(!profile.contains("demo.Main", "add", "(II)I"));

        assert!(ProfileData::parse("demo.Main.answer()J").is_err());
        assert!(ProfileData::parse("demo.Main->answer").is_err());
        assert!(ProfileData::parse("->answer()J").is_err());
    }

    #[test]
    fn test_profile_filter_admission() {
        let mut profile = ProfileData::new();
        profile.add_hot_method("demo.Main", "hot", "()J");
        let (config, _) = CompilerConfigBuilder::new()
            .compiler_filter("speed-profile")
            .profile_data(profile)
            .build()
            .unwrap();
        assert!(config.is_profiled("demo.Main", "hot", "()J"));
        assert!(!config.is_profiled("demo.Main", "cold", "()J"));

        let (no_profile, _) = CompilerConfigBuilder::new()
            .compiler_filter("speed-profile")
            .build()
            .unwrap();
        assert!(!no_profile.is_profiled("demo.Main", "hot", "()J"));
    }

    #[test]
    fn test_verification_results() {
        let results = VerificationResults::new();
        results.record_verified(MethodId(1));
        results.record_rejected(MethodId(2), "stack underflow at 0");
        assert!(results.is_verified(MethodId(1)));
        assert!(results.is_rejected(MethodId(2)));
        assert_eq!(
            results.rejection_reason(MethodId(2)).as_deref(),
            Some("stack underflow at 0")
        );
        assert_eq!(results.rejected_count(), 1);
        assert!(!results.is_verified(MethodId(3)));
    }
}
