use serde::Deserialize;
use serde::Serialize;

use crate::traits::Entity;

/// A record of a made up remote collection. Every attribute has a default so placeholders can be built out of the
/// key alone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeModel {
    pub id:        String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub state:     String,
    pub name:      String,
}

impl FakeModel {
    pub fn new<S: Into<String>>(id: S) -> Self {
        let id = id.into();
        Self {
            name: format!("Item {id}"),
            state: "active".into(),
            id,
            parent_id: None,
        }
    }

    pub fn with_state<S: Into<String>>(mut self, state: S) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parent<S: Into<String>>(mut self, parent_id: S) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

impl Entity for FakeModel {}

/// Shorthand for a batch of [`FakeModel`]s.
pub fn fakes(ids: &[&str]) -> Vec<FakeModel> {
    ids.iter().map(|id| FakeModel::new(*id)).collect()
}

/// Params of a view over [`FakeModel`]s.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FakeParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id:        Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl FakeParams {
    pub fn id<S: Into<String>>(id: S) -> Self {
        Self {
            id:        Some(id.into()),
            parent_id: None,
        }
    }

    pub fn parent<S: Into<String>>(parent_id: S) -> Self {
        Self {
            id:        None,
            parent_id: Some(parent_id.into()),
        }
    }
}
