use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ir::spec::{CustomCallAttr, Operation};

/// Minimum toolkit and driver version for stream-captured and device-side control-flow commands.
pub const DEVICE_GRAPH_MIN_VERSION: u32 = 12030;

/// Custom-call attribute that opts a custom call into command buffers.
pub const COMMAND_BUFFER_COMPATIBLE_ATTR: &str = "command_buffer_compatible";

const CUBLAS_TARGET_PREFIX: &str = "__cublas$";
const CUDNN_TARGET_PREFIX: &str = "__cudnn$";

/// Operation families that can be recorded into a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Fusion,
    Cublas,
    Cudnn,
    CustomCall,
    Collectives,
    Conditionals,
    While,
}

impl CommandKind {
    pub const ALL: [CommandKind; 7] = [
        CommandKind::Fusion,
        CommandKind::Cublas,
        CommandKind::Cudnn,
        CommandKind::CustomCall,
        CommandKind::Collectives,
        CommandKind::Conditionals,
        CommandKind::While,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Fusion => "FUSION",
            CommandKind::Cublas => "CUBLAS",
            CommandKind::Cudnn => "CUDNN",
            CommandKind::CustomCall => "CUSTOM_CALL",
            CommandKind::Collectives => "COLLECTIVES",
            CommandKind::Conditionals => "CONDITIONALS",
            CommandKind::While => "WHILE",
        }
    }

    /// Minimum toolkit and driver version, if the kind has one.
    pub fn min_version(self) -> Option<u32> {
        match self {
            CommandKind::Fusion => None,
            CommandKind::Cublas
            | CommandKind::Cudnn
            | CommandKind::CustomCall
            | CommandKind::Collectives
            | CommandKind::Conditionals
            | CommandKind::While => Some(DEVICE_GRAPH_MIN_VERSION),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown command kind `{0}`")]
pub struct ParseCommandKindError(pub String);

impl FromStr for CommandKind {
    type Err = ParseCommandKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ParseCommandKindError(s.trim().to_string()))
    }
}

/// Toolkit and driver versions of the target device, encoded as `major * 1000 + minor * 10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceVersions {
    pub toolkit: u32,
    pub driver: u32,
}

impl DeviceVersions {
    pub fn new(toolkit: u32, driver: u32) -> Self {
        Self { toolkit, driver }
    }

    /// Both versions reach `min`.
    pub fn satisfies(self, min: u32) -> bool {
        self.toolkit >= min && self.driver >= min
    }
}

/// Set of command kinds enabled for outlining.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBufferConfig {
    kinds: BTreeSet<CommandKind>,
}

impl CommandBufferConfig {
    pub fn all() -> Self {
        Self::from_kinds(CommandKind::ALL)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_kinds(kinds: impl IntoIterator<Item = CommandKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    /// Parses a comma-separated list such as `"FUSION,CUBLAS"`.
    pub fn parse_list(list: &str) -> Result<Self, ParseCommandKindError> {
        list.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(CommandKind::from_str)
            .collect()
    }

    pub fn contains(&self, kind: CommandKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn insert(&mut self, kind: CommandKind) -> bool {
        self.kinds.insert(kind)
    }

    pub fn remove(&mut self, kind: CommandKind) -> bool {
        self.kinds.remove(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = CommandKind> + '_ {
        self.kinds.iter().copied()
    }

    /// Drops every kind the device cannot run.
    pub fn restrict_to(&self, versions: DeviceVersions) -> Self {
        self.kinds()
            .filter(|kind| is_eligible(*kind, self, versions))
            .collect()
    }
}

impl FromIterator<CommandKind> for CommandBufferConfig {
    fn from_iter<I: IntoIterator<Item = CommandKind>>(iter: I) -> Self {
        Self::from_kinds(iter)
    }
}

/// A kind is eligible when it is enabled and the device meets its version requirement.
pub fn is_eligible(kind: CommandKind, config: &CommandBufferConfig, versions: DeviceVersions) -> bool {
    if !config.contains(kind) {
        return false;
    }
    match kind.min_version() {
        Some(min) => versions.satisfies(min),
        None => true,
    }
}

/// Immutable options handed to the pass at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBufferOptions {
    pub enabled: CommandBufferConfig,
    /// Shortest run, counted in commands, worth outlining.
    pub min_num_commands: usize,
}

impl Default for CommandBufferOptions {
    fn default() -> Self {
        Self {
            enabled: CommandBufferConfig::all(),
            min_num_commands: 1,
        }
    }
}

impl CommandBufferOptions {
    pub fn new(enabled: CommandBufferConfig) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn with_min_num_commands(mut self, min_num_commands: usize) -> Self {
        self.min_num_commands = min_num_commands;
        self
    }
}

/// Command kind of a single operation, ignoring what its callees contain.
///
/// Parameters, constants, plain calls and custom calls that did not opt in have no kind and are
/// never commands.
pub fn command_kind_of(op: &Operation) -> Option<CommandKind> {
    match op {
        Operation::ElementwiseUnary(_) | Operation::ElementwiseBinary(_) | Operation::Fusion(_) => {
            Some(CommandKind::Fusion)
        }
        Operation::CustomCall(spec) => {
            if spec.target.starts_with(CUBLAS_TARGET_PREFIX) {
                Some(CommandKind::Cublas)
            } else if spec.target.starts_with(CUDNN_TARGET_PREFIX) {
                Some(CommandKind::Cudnn)
            } else if matches!(
                spec.attrs.get(COMMAND_BUFFER_COMPATIBLE_ATTR),
                Some(CustomCallAttr::Bool(true))
            ) {
                Some(CommandKind::CustomCall)
            } else {
                None
            }
        }
        Operation::Collective(_) => Some(CommandKind::Collectives),
        Operation::Conditional(_) => Some(CommandKind::Conditionals),
        Operation::While(_) => Some(CommandKind::While),
        Operation::Parameter(_)
        | Operation::Constant(_)
        | Operation::Tuple
        | Operation::GetTupleElement(_)
        | Operation::Bitcast
        | Operation::Call(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::ir::spec::{CustomCallSpec, ElementwiseBinaryOp};

    const OLD: DeviceVersions = DeviceVersions {
        toolkit: 12020,
        driver: 12020,
    };
    const NEW: DeviceVersions = DeviceVersions {
        toolkit: 12030,
        driver: 12040,
    };

    fn custom_call(target: &str, compatible: bool) -> Operation {
        let mut attrs = BTreeMap::new();
        if compatible {
            attrs.insert(
                COMMAND_BUFFER_COMPATIBLE_ATTR.to_string(),
                CustomCallAttr::Bool(true),
            );
        }
        Operation::CustomCall(CustomCallSpec {
            target: target.to_string(),
            attrs,
        })
    }

    #[test]
    fn fusion_needs_no_version() {
        let config = CommandBufferConfig::from_kinds([CommandKind::Fusion]);
        assert!(is_eligible(CommandKind::Fusion, &config, OLD));
        assert!(is_eligible(CommandKind::Fusion, &config, DeviceVersions::new(0, 0)));
    }

    #[test]
    fn gated_kinds_need_both_versions() {
        let config = CommandBufferConfig::all();
        for kind in CommandKind::ALL.into_iter().filter(|k| *k != CommandKind::Fusion) {
            assert!(!is_eligible(kind, &config, OLD), "{kind} on old device");
            assert!(is_eligible(kind, &config, NEW), "{kind} on new device");
            assert!(
                !is_eligible(kind, &config, DeviceVersions::new(12030, 12020)),
                "{kind} with an old driver"
            );
        }
    }

    #[test]
    fn disabled_kind_is_never_eligible() {
        let config = CommandBufferConfig::from_kinds([CommandKind::Cublas]);
        assert!(!is_eligible(CommandKind::Fusion, &config, NEW));
        assert!(is_eligible(CommandKind::Cublas, &config, NEW));
    }

    #[test]
    fn parses_kind_lists() {
        let config = CommandBufferConfig::parse_list("fusion, CUBLAS,,custom_call").expect("valid list");
        assert_eq!(
            config.kinds().collect::<Vec<_>>(),
            vec![CommandKind::Fusion, CommandKind::Cublas, CommandKind::CustomCall]
        );
        let err = CommandBufferConfig::parse_list("FUSION,GEMM").expect_err("GEMM is unknown");
        assert_eq!(err, ParseCommandKindError("GEMM".to_string()));
        assert_eq!(CommandKind::Conditionals.to_string(), "CONDITIONALS");
    }

    #[test]
    fn restrict_to_drops_gated_kinds() {
        let restricted = CommandBufferConfig::all().restrict_to(OLD);
        assert_eq!(restricted.kinds().collect::<Vec<_>>(), vec![CommandKind::Fusion]);
    }

    #[test]
    fn classifies_custom_calls_by_target() {
        assert_eq!(
            command_kind_of(&custom_call("__cublas$gemm", false)),
            Some(CommandKind::Cublas)
        );
        assert_eq!(
            command_kind_of(&custom_call("__cudnn$convForward", false)),
            Some(CommandKind::Cudnn)
        );
        assert_eq!(
            command_kind_of(&custom_call("my_kernel", true)),
            Some(CommandKind::CustomCall)
        );
        assert_eq!(command_kind_of(&custom_call("my_kernel", false)), None);
        assert_eq!(
            command_kind_of(&Operation::ElementwiseBinary(ElementwiseBinaryOp::Add)),
            Some(CommandKind::Fusion)
        );
        assert_eq!(command_kind_of(&Operation::Bitcast), None);
    }

    #[test]
    fn serializes_kinds_in_upper_case() {
        let json = serde_json::to_string(&CommandKind::CustomCall).expect("serialize kind");
        assert_eq!(json, "\"CUSTOM_CALL\"");
    }
}
