use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimit;

/// Counts queries in fixed windows that start with the first query.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    window_start: Option<Instant>,
    used: u32,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            window_start: None,
            used: 0,
        }
    }

    /// Takes one query from the allowance, or returns how long until the
    /// window resets.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        match self.window_start {
            Some(start) if now.duration_since(start) < self.limit.window => {}
            _ => {
                self.window_start = Some(now);
                self.used = 0;
            }
        }
        if self.used >= self.limit.max_queries {
            let start = self.window_start.unwrap_or(now);
            return Err(self.limit.window.saturating_sub(now.duration_since(start)));
        }
        self.used += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRejection {
    Empty,
    TooLong { max: usize },
}

impl QueryRejection {
    pub fn user_message(&self) -> String {
        match self {
            QueryRejection::Empty => "Please enter a question.".to_string(),
            QueryRejection::TooLong { max } => {
                format!("Your question is too long. Please keep it under {max} characters.")
            }
        }
    }
}

/// Trims `text` and checks it is a usable query.
pub fn validate_query(text: &str, max_chars: usize) -> Result<&str, QueryRejection> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(QueryRejection::Empty);
    }
    if trimmed.chars().count() > max_chars {
        return Err(QueryRejection::TooLong { max: max_chars });
    }
    Ok(trimmed)
}
