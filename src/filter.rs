//! Filter expressions.
//!
//! A [`Filter`] is sent to the server in its OData form (which is also what goes into query signatures) and can be
//! evaluated locally against an [`Entity`] for records the server hasn't confirmed yet.
use serde::Serialize;
use serde::Serializer;
use std::fmt::Display;

use crate::traits::Entity;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    Eq { prop: String, value: String },
    Ne { prop: String, value: String },
    StartsWith { prop: String, value: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    /// Server-side expression that can't be evaluated locally. Matches everything.
    Raw(String),
}

/// Intermediate step of `Filter::prop("state").eq("running")`.
#[derive(Debug, Clone)]
pub struct PropFilter {
    prop: String,
}

impl PropFilter {
    pub fn eq<S: Into<String>>(self, value: S) -> Filter {
        Filter::Eq {
            prop:  self.prop,
            value: value.into(),
        }
    }

    pub fn ne<S: Into<String>>(self, value: S) -> Filter {
        Filter::Ne {
            prop:  self.prop,
            value: value.into(),
        }
    }

    pub fn starts_with<S: Into<String>>(self, value: S) -> Filter {
        Filter::StartsWith {
            prop:  self.prop,
            value: value.into(),
        }
    }
}

impl Filter {
    pub fn prop<S: Into<String>>(prop: S) -> PropFilter {
        PropFilter { prop: prop.into() }
    }

    pub fn raw<S: Into<String>>(expr: S) -> Self {
        Self::Raw(expr.into())
    }

    pub fn and<I: IntoIterator<Item = Filter>>(filters: I) -> Self {
        Self::And(filters.into_iter().collect())
    }

    pub fn or<I: IntoIterator<Item = Filter>>(filters: I) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(f) | Self::Or(f) => f.iter().all(Filter::is_empty),
            Self::Raw(expr) => expr.trim().is_empty(),
            _ => false,
        }
    }

    pub fn to_odata(&self) -> String {
        match self {
            Self::Eq { prop, value } => format!("{prop} eq '{}'", escape(value)),
            Self::Ne { prop, value } => format!("{prop} ne '{}'", escape(value)),
            Self::StartsWith { prop, value } => format!("startswith({prop}, '{}')", escape(value)),
            Self::And(filters) => join(filters, " and "),
            Self::Or(filters) => join(filters, " or "),
            Self::Raw(expr) => expr.clone(),
        }
    }

    pub fn matches<E: Entity>(&self, entity: &E) -> bool {
        match self {
            Self::Eq { prop, value } => entity.field(prop).as_deref() == Some(value.as_str()),
            Self::Ne { prop, value } => entity.field(prop).as_deref() != Some(value.as_str()),
            Self::StartsWith { prop, value } => entity.field(prop).is_some_and(|v| v.starts_with(value.as_str())),
            Self::And(filters) => filters.iter().all(|f| f.matches(entity)),
            Self::Or(filters) => filters.iter().filter(|f| !f.is_empty()).any(|f| f.matches(entity)) || self.is_empty(),
            Self::Raw(_) => true,
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn join(filters: &[Filter], op: &str) -> String {
    let parts = filters
        .iter()
        .filter(|f| !f.is_empty())
        .map(|f| match f {
            Filter::And(_) | Filter::Or(_) => format!("({})", f.to_odata()),
            _ => f.to_odata(),
        })
        .collect::<Vec<_>>();
    parts.join(op)
}

impl Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_odata())
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_odata())
    }
}
