use serde::{Deserialize, Serialize};

/// One selectable conversational agent shown as its own chat pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_selected")]
    pub selected: bool,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            selected: true,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_selected(mut self, selected: bool) -> Self {
        self.selected = selected;
        self
    }
}

fn default_selected() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    RemoteApi,
    StaticFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub source: ModelCatalogSource,
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_remote_api(models: Vec<Model>) -> Self {
        Self {
            models,
            source: ModelCatalogSource::RemoteApi,
            warning: None,
        }
    }

    pub fn from_static_fallback(models: Vec<Model>, warning: String) -> Self {
        Self {
            models,
            source: ModelCatalogSource::StaticFallback,
            warning: Some(warning),
        }
    }
}

/// Built-in pane catalog used when settings do not list any models.
pub fn default_models() -> Vec<Model> {
    vec![
        Model::new("claude-3-7-sonnet-latest", "Claude 3.7 Sonnet")
            .with_description("Balanced performance and speed"),
        Model::new("claude-3-5-sonnet-latest", "Claude 3.5 Sonnet")
            .with_description("Balanced performance"),
        Model::new("claude-3-opus-latest", "Claude 3 Opus").with_description("Highest capability"),
        Model::new("gpt-4o-mini-2025-04-16", "GPT-4o-mini").with_description("Fast responses"),
        Model::new("gpt-4_1-2025-04-14", "GPT4.1").with_description("OpenAI's latest model"),
        Model::new("gpt-4-turbo", "GPT-4 Turbo").with_description("OpenAI's reliable model"),
    ]
}
