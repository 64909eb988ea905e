// This module selects the instruction set the harness compiles for and the feature profile
// used during code generation. InstructionSet enumerates the supported targets together with
// their static properties (pointer size, code alignment, printable name, thumb-bit handling
// for entry points). InstructionSetFeatures is the feature profile: it starts from the host's
// compile-time target features, from a generic baseline, or from a named CPU variant, and can
// be adjusted with "+feature"/"-feature" tokens. InstructionSetSelector ties the two together:
// apply_instruction_set picks the host target (mapping a 32-bit ARM host to Thumb2, which is
// the only ARM encoding the compiler emits), and override_instruction_set_features replaces
// the profile from a variant string, rejecting unknown tokens.

//! Instruction set selection and feature profiles.

use super::error::{HarnessError, HarnessResult};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Target instruction sets known to the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionSet {
    None,
    Arm,
    Thumb2,
    Arm64,
    X86,
    X86_64,
    Riscv64,
}

/// Instruction set of the process running the harness.
#[cfg(target_arch = "arm")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::Arm;
#[cfg(target_arch = "aarch64")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::Arm64;
#[cfg(target_arch = "x86")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::X86;
#[cfg(target_arch = "x86_64")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::X86_64;
#[cfg(target_arch = "riscv64")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::Riscv64;
#[cfg(not(any(
    target_arch = "arm",
    target_arch = "aarch64",
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "riscv64"
)))]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::None;

impl InstructionSet {
    pub fn name(self) -> &'static str {
        match self {
            InstructionSet::None => "none",
            InstructionSet::Arm => "arm",
            InstructionSet::Thumb2 => "thumb2",
            InstructionSet::Arm64 => "arm64",
            InstructionSet::X86 => "x86",
            InstructionSet::X86_64 => "x86_64",
            InstructionSet::Riscv64 => "riscv64",
        }
    }

    pub fn is_64_bit(self) -> bool {
        matches!(
            self,
            InstructionSet::Arm64 | InstructionSet::X86_64 | InstructionSet::Riscv64
        )
    }

    pub fn pointer_size(self) -> usize {
        if self.is_64_bit() {
            8
        } else {
            4
        }
    }

    /// Required alignment of the first instruction of a method.
    pub fn code_alignment(self) -> usize {
        match self {
            InstructionSet::Arm | InstructionSet::Thumb2 => 8,
            _ => 16,
        }
    }

    /// The set whose feature table this set uses. Thumb2 shares the ARM table.
    pub fn feature_family(self) -> InstructionSet {
        match self {
            InstructionSet::Thumb2 => InstructionSet::Arm,
            other => other,
        }
    }

    /// Entry point value for code starting at `address`.
    ///
    /// Thumb2 entry points carry the Thumb bit so that a branch-and-exchange
    /// switches the core into Thumb state.
    pub fn code_pointer(self, address: usize) -> usize {
        match self {
            InstructionSet::Thumb2 => address | 1,
            _ => address,
        }
    }
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InstructionSet {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "arm" => Ok(InstructionSet::Arm),
            "thumb2" => Ok(InstructionSet::Thumb2),
            "arm64" | "aarch64" => Ok(InstructionSet::Arm64),
            "x86" => Ok(InstructionSet::X86),
            "x86_64" | "x86-64" => Ok(InstructionSet::X86_64),
            "riscv64" => Ok(InstructionSet::Riscv64),
            other => Err(HarnessError::configuration(format!(
                "unknown instruction set `{other}`"
            ))),
        }
    }
}

const ARM_FEATURES: &[&str] = &["div", "atomic_ldrd_strd", "armv8a"];
const ARM64_FEATURES: &[&str] = &["crc", "lse", "fp16", "dotprod", "sve"];
const X86_FEATURES: &[&str] = &["ssse3", "sse4.1", "sse4.2", "avx", "avx2", "popcnt"];

type VariantTable = &'static [(&'static str, &'static [&'static str])];

const ARM_VARIANTS: VariantTable = &[
    ("generic", &[]),
    ("default", &[]),
    ("cortex-a7", &["div", "atomic_ldrd_strd"]),
    ("cortex-a15", &["div", "atomic_ldrd_strd"]),
    ("krait", &["div", "atomic_ldrd_strd"]),
    ("cortex-a53", &["div", "atomic_ldrd_strd", "armv8a"]),
    ("cortex-a57", &["div", "atomic_ldrd_strd", "armv8a"]),
    ("cortex-a72", &["div", "atomic_ldrd_strd", "armv8a"]),
    ("kryo", &["div", "atomic_ldrd_strd", "armv8a"]),
];

const ARM64_VARIANTS: VariantTable = &[
    ("generic", &[]),
    ("default", &[]),
    ("cortex-a53", &["crc"]),
    ("cortex-a57", &["crc"]),
    ("cortex-a72", &["crc"]),
    ("kryo", &["crc"]),
    ("cortex-a55", &["crc", "lse", "fp16", "dotprod"]),
    ("cortex-a75", &["crc", "lse", "fp16", "dotprod"]),
    ("cortex-a76", &["crc", "lse", "fp16", "dotprod"]),
];

const X86_VARIANTS: VariantTable = &[
    ("generic", &[]),
    ("default", &[]),
    ("x86-64", &[]),
    ("atom", &["ssse3"]),
    ("sandybridge", &["ssse3", "sse4.1", "sse4.2", "popcnt"]),
    ("silvermont", &["ssse3", "sse4.1", "sse4.2", "popcnt"]),
    ("haswell", &["ssse3", "sse4.1", "sse4.2", "popcnt", "avx", "avx2"]),
    ("kabylake", &["ssse3", "sse4.1", "sse4.2", "popcnt", "avx", "avx2"]),
];

const PLAIN_VARIANTS: VariantTable = &[("generic", &[]), ("default", &[])];

fn feature_table(family: InstructionSet) -> &'static [&'static str] {
    match family {
        InstructionSet::Arm => ARM_FEATURES,
        InstructionSet::Arm64 => ARM64_FEATURES,
        InstructionSet::X86 | InstructionSet::X86_64 => X86_FEATURES,
        _ => &[],
    }
}

fn variant_table(family: InstructionSet) -> VariantTable {
    match family {
        InstructionSet::Arm => ARM_VARIANTS,
        InstructionSet::Arm64 => ARM64_VARIANTS,
        InstructionSet::X86 | InstructionSet::X86_64 => X86_VARIANTS,
        _ => PLAIN_VARIANTS,
    }
}

/// Feature profile for one instruction set family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionSetFeatures {
    isa: InstructionSet,
    variant: String,
    features: BTreeSet<&'static str>,
}

impl InstructionSetFeatures {
    /// Baseline profile with no optional features.
    pub fn generic(isa: InstructionSet) -> Self {
        Self {
            isa: isa.feature_family(),
            variant: "generic".to_string(),
            features: BTreeSet::new(),
        }
    }

    /// Profile describing the features the harness binary was built with.
    pub fn from_host() -> Self {
        let detected: &[(&'static str, bool)] = match RUNTIME_ISA.feature_family() {
            InstructionSet::X86 | InstructionSet::X86_64 => &[
                ("ssse3", cfg!(target_feature = "ssse3")),
                ("sse4.1", cfg!(target_feature = "sse4.1")),
                ("sse4.2", cfg!(target_feature = "sse4.2")),
                ("avx", cfg!(target_feature = "avx")),
                ("avx2", cfg!(target_feature = "avx2")),
                ("popcnt", cfg!(target_feature = "popcnt")),
            ],
            InstructionSet::Arm64 => &[
                ("crc", cfg!(target_feature = "crc")),
                ("lse", cfg!(target_feature = "lse")),
                ("fp16", cfg!(target_feature = "fp16")),
                ("dotprod", cfg!(target_feature = "dotprod")),
                ("sve", cfg!(target_feature = "sve")),
            ],
            _ => &[],
        };

        Self {
            isa: RUNTIME_ISA.feature_family(),
            variant: "host".to_string(),
            features: detected
                .iter()
                .filter(|(_, enabled)| *enabled)
                .map(|(name, _)| *name)
                .collect(),
        }
    }

    /// Parse a variant description such as `cortex-a53,+lse,-crc`.
    pub fn from_variant(isa: InstructionSet, variant: &str) -> HarnessResult<Self> {
        let family = isa.feature_family();
        let known = feature_table(family);
        let invalid = |token: &str| HarnessError::InvalidVariant {
            isa,
            token: token.to_string(),
        };

        let mut tokens = variant.split(',').map(str::trim).peekable();
        let mut profile = Self::generic(family);

        if let Some(first) = tokens.peek() {
            if let Some((name, features)) =
                variant_table(family).iter().find(|(name, _)| name == first)
            {
                profile.variant = name.to_string();
                profile.features = features.iter().copied().collect();
                tokens.next();
            }
        }

        for token in tokens {
            let (enable, name) = match token.as_bytes().first() {
                Some(b'+') => (true, &token[1..]),
                Some(b'-') => (false, &token[1..]),
                Some(_) => (true, token),
                None => return Err(invalid(token)),
            };
            let feature = known
                .iter()
                .copied()
                .find(|known| *known == name)
                .ok_or_else(|| invalid(token))?;
            if enable {
                profile.features.insert(feature);
            } else {
                profile.features.remove(feature);
            }
        }

        Ok(profile)
    }

    /// Feature family this profile was built for.
    pub fn isa(&self) -> InstructionSet {
        self.isa
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn has(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn is_compatible_with(&self, isa: InstructionSet) -> bool {
        isa != InstructionSet::None && self.isa == isa.feature_family()
    }

    /// Comma separated feature list, `none` when empty.
    pub fn feature_string(&self) -> String {
        if self.features.is_empty() {
            "none".to_string()
        } else {
            self.features.iter().copied().collect::<Vec<_>>().join(",")
        }
    }
}

/// Target instruction set together with the features code generation may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionSetProfile {
    pub instruction_set: InstructionSet,
    pub features: InstructionSetFeatures,
}

impl InstructionSetProfile {
    pub fn new(instruction_set: InstructionSet, features: InstructionSetFeatures) -> Self {
        Self {
            instruction_set,
            features,
        }
    }

    /// Profile for `instruction_set` with the generic feature baseline.
    pub fn generic(instruction_set: InstructionSet) -> Self {
        Self::new(instruction_set, InstructionSetFeatures::generic(instruction_set))
    }

    /// Check that the feature profile belongs to the instruction set.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.instruction_set == InstructionSet::None {
            return Err(HarnessError::configuration(
                "no instruction set selected for this host",
            ));
        }
        if !self.features.is_compatible_with(self.instruction_set) {
            return Err(HarnessError::configuration(format!(
                "{} features cannot be used with instruction set {}",
                self.features.isa(),
                self.instruction_set
            )));
        }
        Ok(())
    }
}

impl fmt::Display for InstructionSetProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}: {})",
            self.instruction_set,
            self.features.variant(),
            self.features.feature_string()
        )
    }
}

/// Resolves the target instruction set for a given host.
#[derive(Debug, Clone, Copy)]
pub struct InstructionSetSelector {
    host: InstructionSet,
}

impl InstructionSetSelector {
    /// Selector for the process' own instruction set.
    pub fn new() -> Self {
        Self { host: RUNTIME_ISA }
    }

    /// Selector for an arbitrary host, used to check the host mapping rules.
    pub fn for_host(host: InstructionSet) -> Self {
        Self { host }
    }

    pub fn host(&self) -> InstructionSet {
        self.host
    }

    /// Pick the active target for the host.
    ///
    /// A 32-bit ARM host always compiles to Thumb2.
    pub fn apply_instruction_set(&self) -> InstructionSetProfile {
        let instruction_set = match self.host {
            InstructionSet::Arm => InstructionSet::Thumb2,
            other => other,
        };
        let features = if self.host == RUNTIME_ISA {
            InstructionSetFeatures::from_host()
        } else {
            InstructionSetFeatures::generic(instruction_set)
        };
        log::debug!("Selected instruction set {} for host {}", instruction_set, self.host);
        InstructionSetProfile::new(instruction_set, features)
    }

    /// Replace the feature profile of `instruction_set` with one parsed from `variant`.
    pub fn override_instruction_set_features(
        &self,
        instruction_set: InstructionSet,
        variant: &str,
    ) -> HarnessResult<InstructionSetProfile> {
        let features = InstructionSetFeatures::from_variant(instruction_set, variant)?;
        let profile = InstructionSetProfile::new(instruction_set, features);
        log::debug!("Overrode instruction set features: {}", profile);
        Ok(profile)
    }
}

impl Default for InstructionSetSelector {
    fn default() -> Self {
        Self::new()
    }
}
