//! In-band `@@tokenhub` directives.
//!
//! The first line of the first user message may carry
//! `@@tokenhub key=value[ key=value]*`. Recognized pairs contribute to
//! the resolved policy and are stripped — together with the prefix —
//! from the content forwarded to adapters. Unknown keys are ignored
//! (logged once per key) and left in place. Stripping is idempotent.

use std::collections::HashSet;
use std::sync::Mutex;

use lazy_static::lazy_static;
use tracing::warn;

use crate::llm::{ChatMessage, MessageRole};
use crate::models::RouteMode;
use crate::{GatewayError, Result};

pub const DIRECTIVE_PREFIX: &str = "@@tokenhub";

lazy_static! {
    static ref WARNED_KEYS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Policy fields parsed out of an in-band directive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directives {
    pub mode: Option<RouteMode>,
    pub max_budget_usd: Option<f64>,
    pub max_latency_ms: Option<u64>,
    pub min_weight: Option<f64>,
}

impl Directives {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.max_budget_usd.is_none()
            && self.max_latency_ms.is_none()
            && self.min_weight.is_none()
    }
}

/// Parse directives from the messages and strip them. Returns the parsed
/// directives and the messages as the adapters will see them.
pub fn extract(messages: &[ChatMessage]) -> Result<(Directives, Vec<ChatMessage>)> {
    let mut out = messages.to_vec();
    let Some(first_user) = out.iter_mut().find(|m| m.role == MessageRole::User) else {
        return Ok((Directives::default(), out));
    };

    let content = first_user.content.clone();
    let (first_line, rest) = match content.split_once('\n') {
        Some((line, rest)) => (line, Some(rest)),
        None => (content.as_str(), None),
    };

    let mut tokens = first_line.split_whitespace();
    if tokens.next() != Some(DIRECTIVE_PREFIX) {
        return Ok((Directives::default(), out));
    }

    let mut directives = Directives::default();
    let mut residual: Vec<&str> = Vec::new();
    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            residual.push(token);
            continue;
        };
        match key {
            "mode" => directives.mode = Some(RouteMode::parse(value)?),
            "max_budget_usd" => {
                directives.max_budget_usd = Some(parse_number(key, value)?);
            }
            "max_latency_ms" => {
                directives.max_latency_ms = Some(
                    value.parse::<u64>().map_err(|_| {
                        GatewayError::InvalidRequest(format!(
                            "directive {}={:?} is not an integer",
                            key, value
                        ))
                    })?,
                );
            }
            "min_weight" => {
                directives.min_weight = Some(parse_number(key, value)?);
            }
            unknown => {
                warn_once(unknown);
                residual.push(token);
            }
        }
    }

    // Rebuild the first line from whatever was not recognized; drop the
    // line entirely when nothing remains.
    let residual_line = residual.join(" ");
    first_user.content = match (residual_line.is_empty(), rest) {
        (true, Some(rest)) => rest.to_string(),
        (true, None) => String::new(),
        (false, Some(rest)) => format!("{}\n{}", residual_line, rest),
        (false, None) => residual_line,
    };

    Ok((directives, out))
}

fn parse_number(key: &str, value: &str) -> Result<f64> {
    value.parse::<f64>().map_err(|_| {
        GatewayError::InvalidRequest(format!("directive {}={:?} is not a number", key, value))
    })
}

fn warn_once(key: &str) {
    let mut warned = WARNED_KEYS.lock().unwrap();
    if warned.insert(key.to_string()) {
        warn!(key, "unknown directive key ignored");
    }
}
