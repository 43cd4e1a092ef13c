//! World modifiers: a closed vocabulary of rule overrides passed to the server.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifierKey {
    Combat,
    DeathPenalty,
    Resources,
    Raids,
    Portals,
}

impl ModifierKey {
    pub const ALL: [ModifierKey; 5] = [
        ModifierKey::Combat,
        ModifierKey::DeathPenalty,
        ModifierKey::Resources,
        ModifierKey::Raids,
        ModifierKey::Portals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModifierKey::Combat => "combat",
            ModifierKey::DeathPenalty => "deathpenalty",
            ModifierKey::Resources => "resources",
            ModifierKey::Raids => "raids",
            ModifierKey::Portals => "portals",
        }
    }

    /// Values the game server accepts for this key.
    pub fn allowed_values(&self) -> &'static [&'static str] {
        match self {
            ModifierKey::Combat => &["veryeasy", "easy", "hard", "veryhard"],
            ModifierKey::DeathPenalty => &["casual", "veryeasy", "easy", "hard", "hardcore"],
            ModifierKey::Resources => &["muchless", "less", "more", "muchmore", "most"],
            ModifierKey::Raids => &["none", "muchless", "less", "more", "muchmore"],
            ModifierKey::Portals => &["casual", "hard", "veryhard"],
        }
    }

    pub fn parse(key: &str) -> Result<Self, ValidationError> {
        let k = key.trim().to_ascii_lowercase();
        ModifierKey::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == k)
            .ok_or_else(|| ValidationError::UnknownModifier(key.to_string()))
    }
}

impl std::fmt::Display for ModifierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unchecked modifier as it arrives in a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifierInput {
    pub key: String,
    pub value: String,
}

/// A validated modifier. Only constructed through [`Modifier::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifier {
    pub key: ModifierKey,
    pub value: String,
}

impl Modifier {
    pub fn parse(key: &str, value: &str) -> Result<Self, ValidationError> {
        let key = ModifierKey::parse(key)?;
        let v = value.trim().to_ascii_lowercase();
        if !key.allowed_values().contains(&v.as_str()) {
            return Err(ValidationError::ModifierValue {
                key: key.as_str(),
                value: value.to_string(),
                allowed: key.allowed_values().join("|"),
            });
        }
        Ok(Self { key, value: v })
    }
}

/// At most one modifier per key, so five slots cover every valid list.
pub type Modifiers = SmallVec<[Modifier; 5]>;

/// Validate a request's modifier list, keeping its order.
pub fn parse_modifiers(inputs: &[ModifierInput]) -> Result<Modifiers, ValidationError> {
    let mut out = Modifiers::new();
    for m in inputs {
        let parsed = Modifier::parse(&m.key, &m.value)?;
        if out.iter().any(|x| x.key == parsed.key) {
            return Err(ValidationError::DuplicateModifier(parsed.key.as_str()));
        }
        out.push(parsed);
    }
    Ok(out)
}
