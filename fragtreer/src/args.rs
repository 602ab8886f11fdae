use std::fmt::Display;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use fragtree::TreeBuilderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgTreeBuilder {
    #[default]
    /// Solve the maximum colorful subtree exactly over the best-ranked colors
    Exact,
    /// Grow the tree from the root, always taking the best remaining edge
    Greedy,
}

impl Display for ArgTreeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ArgTreeBuilder> for TreeBuilderKind {
    fn from(value: ArgTreeBuilder) -> Self {
        match value {
            ArgTreeBuilder::Exact => TreeBuilderKind::Exact,
            ArgTreeBuilder::Greedy => TreeBuilderKind::Greedy,
        }
    }
}

pub fn non_negative_float_f64(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if value < 0.0 {
        Err(format!("`{s}` is less than zero"))
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_non_negative() {
        assert_eq!(non_negative_float_f64("2.5"), Ok(2.5));
        assert!(non_negative_float_f64("-1").is_err());
        assert!(non_negative_float_f64("x").is_err());
    }

    #[test]
    fn test_builder_conversion() {
        assert_eq!(TreeBuilderKind::from(ArgTreeBuilder::Greedy), TreeBuilderKind::Greedy);
        assert_eq!(ArgTreeBuilder::default().to_string(), "Exact");
    }
}
