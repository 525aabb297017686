//! Query shaping and degradation.
//!
//! Both entry points are pure functions over opaque query text plus a
//! small set of recognized `SINCE <window> ago` markers. They know
//! nothing about what the query computes.

/// Time windows recognized in query text, largest first. Degradation
/// walks this ladder one rung at a time.
pub const WINDOW_LADDER: [&str; 6] = [
    "7 days",
    "1 day",
    "6 hours",
    "1 hour",
    "30 minutes",
    "10 minutes",
];

/// Initial shape for a query against a target of estimated volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryShape {
    pub window: &'static str,
    pub row_limit: u32,
    pub sampling: Option<&'static str>,
}

/// Pick `{window, limit, sampling}` from the fixed volume-tier table.
/// No history is consulted.
pub fn select_shape(estimated_volume: u64) -> QueryShape {
    if estimated_volume >= 10_000_000 {
        QueryShape {
            window: "30 minutes",
            row_limit: 50,
            sampling: Some("SAMPLE 1 percent"),
        }
    } else if estimated_volume >= 1_000_000 {
        QueryShape {
            window: "1 hour",
            row_limit: 200,
            sampling: Some("SAMPLE 10 percent"),
        }
    } else if estimated_volume >= 100_000 {
        QueryShape {
            window: "6 hours",
            row_limit: 500,
            sampling: None,
        }
    } else {
        QueryShape {
            window: "7 days",
            row_limit: 100,
            sampling: None,
        }
    }
}

/// Produce a strictly cheaper variant of a query that timed out, by
/// replacing the first matching window marker with the next rung down.
/// Returns the query unchanged when no rung above the smallest matches;
/// callers must treat an unchanged result as non-degradable.
pub fn degrade(query: &str) -> String {
    for i in 0..WINDOW_LADDER.len() - 1 {
        let marker = format!("SINCE {} ago", WINDOW_LADDER[i]);
        if query.contains(&marker) {
            let replacement = format!("SINCE {} ago", WINDOW_LADDER[i + 1]);
            return query.replacen(&marker, &replacement, 1);
        }
    }
    query.to_string()
}

/// True when `degrade` would still shrink this query.
pub fn is_degradable(query: &str) -> bool {
    WINDOW_LADDER[..WINDOW_LADDER.len() - 1]
        .iter()
        .any(|w| query.contains(&format!("SINCE {} ago", w)))
}
