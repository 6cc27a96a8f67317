use thiserror::Error;

/// Domain failures of the harness. Model and I/O plumbing errors travel as
/// `anyhow::Error` / `candle_core::Error` instead.
#[derive(Error, Debug)]
pub enum KvBenchError {
    #[error("baseline `{0}` is not implemented")]
    UnknownBaseline(String),
    #[error("conversation type `{0}` is not implemented")]
    UnknownConvType(String),
    #[error("truncation policy `{0}` is not implemented")]
    UnknownTruncation(String),
    #[error("dataset `{0}` has no entry in `{1}`")]
    UnknownDataset(String, &'static str),
    #[error("malformed answer for `{task}`: {reason}")]
    MalformedAnswer { task: String, reason: String },
    #[error("record for `{task}` is missing field `{field}`")]
    MissingField { task: String, field: String },
    #[error("`{task}` input does not match the expected layout: {reason}")]
    MalformedInput { task: String, reason: String },
    #[error("prompt format references unknown field `{0}`")]
    MissingPromptField(String),
    #[error("prompt format is malformed: {0}")]
    MalformedPromptFormat(String),
    #[error("rank {rank} is out of range for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },
    #[error("sample index {index} is out of range for {len} examples")]
    SampleOutOfRange { index: usize, len: usize },
    #[error("config override `{0}` must have the form `key=value`")]
    MalformedOverride(String),
    #[error("`{0}` requires `{1}` to be set in the config")]
    MissingConfigKey(&'static str, &'static str),
    #[error("`{0}` is not a supported data type")]
    UnsupportedDtype(String),
    #[error("`{dataset}` generates {max_gen} tokens, leaving no room for a prompt within max_len {max_length}")]
    NoPromptBudget {
        dataset: String,
        max_length: usize,
        max_gen: usize,
    },
    #[error("ATT_CONFIG cannot be combined with baseline `{0}`")]
    AttentionConfigConflict(String),
}
