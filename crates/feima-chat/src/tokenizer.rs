//! Token counting with a BPE encoder keyed by model family.
//!
//! Encoders are expensive to build, so each is created once per process.
//! When no encoder is available the character heuristic keeps the count
//! usable rather than failing the host's budget math.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tracing::debug;

fn o200k() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| match tiktoken_rs::o200k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                debug!(error = %e, "o200k encoder unavailable");
                None
            }
        })
        .as_ref()
}

fn cl100k() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                debug!(error = %e, "cl100k encoder unavailable");
                None
            }
        })
        .as_ref()
}

fn encoder_for(family: &str) -> Option<&'static CoreBPE> {
    let family = family.to_ascii_lowercase();
    // Older GPT families use cl100k; everything newer (and anything
    // unrecognized) gets the widely shared o200k encoding.
    if family.starts_with("gpt-3") || family.starts_with("gpt-4") {
        cl100k()
    } else {
        o200k()
    }
}

pub fn count_tokens(family: &str, text: &str) -> usize {
    match encoder_for(family) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => heuristic(text),
    }
}

/// Four characters per token, rounded up.
fn heuristic(text: &str) -> usize {
    text.len().div_ceil(4)
}
