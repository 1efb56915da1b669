//! Reward categories.

use serde::{Deserialize, Serialize};

use super::{require_non_empty, trim_optional};
use crate::error::{LedgerError, Result};

const MAX_NAME_CHARS: usize = 50;
const MAX_DESCRIPTION_CHARS: usize = 200;

/// A category reward entries are filed under.
///
/// Immutable once constructed; use [`RewardCategory::update`] to obtain a
/// validated copy with changed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardCategory {
    /// Unique identifier
    pub id: String,

    /// Display name (1-50 chars; letters, digits, space, `-`, `_`, `.`)
    pub name: String,

    /// Optional description (up to 200 chars)
    pub description: Option<String>,

    /// Display color (e.g. "#FFB300")
    pub color: String,

    /// Icon reference understood by the presentation layer
    pub icon: String,

    /// Whether this is one of the built-in default categories
    pub is_default: bool,
}

/// Changed fields for [`RewardCategory::update`].
///
/// `description` uses a nested `Option`: the outer level means "change this
/// field", the inner level is the new value (or `None` to clear it).
#[derive(Debug, Default, Clone)]
pub struct CategoryPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub color: Option<String>,
    pub icon: Option<String>,
}

impl RewardCategory {
    /// Construct a validated category.
    pub fn new(
        id: impl Into<String>,
        name: &str,
        description: Option<&str>,
        color: &str,
        icon: &str,
        is_default: bool,
    ) -> Result<Self> {
        let id = require_non_empty("category id", &id.into())?;
        let name = validate_name(name)?;
        let description = validate_description(description)?;
        Ok(Self {
            id,
            name,
            description,
            color: color.trim().to_string(),
            icon: icon.trim().to_string(),
            is_default,
        })
    }

    /// Return a copy with the patched fields, re-running validation on each
    /// changed field.
    pub fn update(&self, patch: CategoryPatch) -> Result<Self> {
        let mut next = self.clone();
        if let Some(name) = patch.name {
            next.name = validate_name(&name)?;
        }
        if let Some(description) = patch.description {
            next.description = validate_description(description.as_deref())?;
        }
        if let Some(color) = patch.color {
            next.color = color.trim().to_string();
        }
        if let Some(icon) = patch.icon {
            next.icon = icon.trim().to_string();
        }
        Ok(next)
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = require_non_empty("category name", name)?;
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(LedgerError::validation(format!(
            "category name exceeds {MAX_NAME_CHARS} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.')))
    {
        return Err(LedgerError::validation(format!(
            "category name contains unsupported character '{bad}'"
        )));
    }
    Ok(name)
}

fn validate_description(description: Option<&str>) -> Result<Option<String>> {
    let description = trim_optional(description);
    if let Some(ref text) = description {
        if text.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(LedgerError::validation(format!(
                "category description exceeds {MAX_DESCRIPTION_CHARS} characters"
            )));
        }
    }
    Ok(description)
}
