//! polyeval - cross-lingual evaluation of language models.
//!
//! ## Architecture
//!
//! - **Dataset**: `EntryStore` loads per-language entry files; `PairBuilder`
//!   aligns two languages into pairs
//! - **Backend**: `ModelBackend` hides API, TGI and vLLM servers behind batched
//!   generation and forward scoring; `BackendRegistry` keeps one live backend per key
//! - **Interface**: `ModelInterface` renders family chat templates and parses replies
//! - **Pool**: `BatchCollector` runs tasks behind an admission gate
//! - **Output**: `ResultWriter` merges, deduplicates and sorts result files
//!
//! ## Result types
//!
//! - **preference_direct**: compare the likelihood of the verdicts "A" and "B"
//! - **preference_cot**: reason first, then parse the final verdict
//! - **perplexity**: answer log-likelihood given the question
//! - **response**: free-form answers
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Backend capacity and network uncertainties (shrink, retry, backoff)

pub mod backend;
pub mod client;
pub mod dataset;
pub mod interface;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use backend::{
    ApiBackend, BackendFactory, BackendKey, BackendKind, BackendRegistry, ModelBackend,
    RegisteredBackend,
};
pub use client::{LLMClient, RateLimiter};
pub use dataset::{EntryStore, PairBuilder, load_keywords, unmatched_keyword_ids};
pub use interface::{ModelFamily, ModelInterface, create_interface};
pub use models::{
    ComparisonResult, Config, CorrectnessLabel, Entry, EvalError, InferenceResult, Pair, Result,
    ResultType, RunReport, Task, Verdict,
};
pub use output::ResultWriter;
pub use pipeline::EvaluationRun;
pub use pool::{BatchCollector, Collection};
