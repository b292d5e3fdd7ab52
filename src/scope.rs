use serde::{Deserialize, Serialize};
use std::fmt;

/// The specificity at which a set of parameters was fitted.
///
/// Variants are declared most specific first, so the derived `Ord` sorts a
/// fallback walk in the order it is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    CircuitCompound,
    Compound,
    Global,
    Default,
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeLevel::CircuitCompound => "circuit+compound",
            ScopeLevel::Compound => "compound",
            ScopeLevel::Global => "global",
            ScopeLevel::Default => "default",
        };
        f.write_str(name)
    }
}

/// Optional circuit × optional compound.
///
/// Circuits are stored lowercase and compounds uppercase so that
/// `"Bahrain"/"soft"` and `"bahrain"/"SOFT"` name the same scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ScopeKey {
    pub circuit: Option<String>,
    pub compound: Option<String>,
}

impl ScopeKey {
    pub fn new(circuit: Option<&str>, compound: Option<&str>) -> Self {
        Self {
            circuit: circuit.and_then(normalize).map(|c| c.to_lowercase()),
            compound: compound.and_then(normalize).map(|c| c.to_uppercase()),
        }
    }

    pub fn global() -> Self {
        Self::default()
    }

    pub fn compound(compound: &str) -> Self {
        Self::new(None, Some(compound))
    }

    pub fn circuit_compound(circuit: &str, compound: &str) -> Self {
        Self::new(Some(circuit), Some(compound))
    }

    /// Level of this key. A circuit without a compound is not a level of
    /// its own and is treated as global.
    pub fn level(&self) -> ScopeLevel {
        match (&self.circuit, &self.compound) {
            (Some(_), Some(_)) => ScopeLevel::CircuitCompound,
            (None, Some(_)) => ScopeLevel::Compound,
            _ => ScopeLevel::Global,
        }
    }

    /// Stored scopes to try, most specific first. The built-in default is
    /// not a stored scope and is handled by the caller.
    pub fn fallback_chain(&self) -> Vec<ScopeKey> {
        let mut chain = Vec::with_capacity(3);
        if let (Some(circuit), Some(compound)) = (&self.circuit, &self.compound) {
            chain.push(ScopeKey::circuit_compound(circuit, compound));
        }
        if let Some(compound) = &self.compound {
            chain.push(ScopeKey::compound(compound));
        }
        chain.push(ScopeKey::global());
        chain
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.circuit, &self.compound) {
            (Some(circuit), Some(compound)) => write!(f, "{}/{}", circuit, compound),
            (None, Some(compound)) => write!(f, "*/{}", compound),
            (Some(circuit), None) => write!(f, "{}/*", circuit),
            (None, None) => f.write_str("global"),
        }
    }
}

fn normalize(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_normalized() {
        let a = ScopeKey::circuit_compound(" Bahrain ", "soft");
        let b = ScopeKey::new(Some("bahrain"), Some("SOFT"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "bahrain/SOFT");
        assert_eq!(ScopeKey::new(Some(""), Some("  ")), ScopeKey::global());
    }

    #[test]
    fn fallback_chain_is_most_specific_first() {
        let chain = ScopeKey::circuit_compound("monza", "HARD").fallback_chain();
        let levels: Vec<_> = chain.iter().map(ScopeKey::level).collect();
        assert_eq!(
            levels,
            vec![ScopeLevel::CircuitCompound, ScopeLevel::Compound, ScopeLevel::Global]
        );

        let chain = ScopeKey::new(Some("monza"), None).fallback_chain();
        assert_eq!(chain, vec![ScopeKey::global()]);
    }

    #[test]
    fn levels_order_by_specificity() {
        assert!(ScopeLevel::CircuitCompound < ScopeLevel::Compound);
        assert!(ScopeLevel::Global < ScopeLevel::Default);
    }
}
