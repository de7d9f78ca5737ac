//! Agent manifests and the registrations the broker builds from them.
//!
//! A manifest is what an agent declares about itself in `agent.register`;
//! an [`AgentRegistration`] is the same data plus the broker-assigned
//! `agent_id`, as returned in the catalog.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One command an agent accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// One UI widget an agent offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetSpec {
    pub id: String,
    /// View module the UI loads for this widget.
    #[serde(default)]
    pub module: String,
    /// Component inside `module`, when it exports more than one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

/// Payload of `agent.register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default, alias = "panels")]
    pub widgets: Vec<WidgetSpec>,
}

/// Catalog entry for one connected agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub widgets: Vec<WidgetSpec>,
}

impl AgentRegistration {
    pub fn from_manifest(agent_id: impl Into<String>, manifest: AgentManifest) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: manifest.name,
            description: manifest.description,
            commands: manifest.commands,
            widgets: manifest.widgets,
        }
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.iter().any(|c| c.name == name)
    }

    /// The widget a UI should open first: the one flagged `default`, else
    /// the first declared.
    pub fn default_widget(&self) -> Option<&WidgetSpec> {
        self.widgets
            .iter()
            .find(|w| w.default)
            .or_else(|| self.widgets.first())
    }
}

/// Fluent builder for [`AgentManifest`].
///
/// ```
/// use mist_protocol::ManifestBuilder;
///
/// let manifest = ManifestBuilder::new("notes")
///     .description("Note-taking and knowledge synthesis")
///     .command("note", "Save a quick note")
///     .command_with_args("recall", "Recall notes on a topic", serde_json::json!({"query": "str"}))
///     .widget("chat", "chat", true)
///     .build();
///
/// assert_eq!(manifest.commands.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    manifest: AgentManifest,
}

impl ManifestBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            manifest: AgentManifest {
                name: name.into(),
                description: String::new(),
                commands: Vec::new(),
                widgets: Vec::new(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.manifest.description = description.into();
        self
    }

    pub fn command(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.manifest.commands.push(CommandSpec {
            name: name.into(),
            description: description.into(),
            args: None,
        });
        self
    }

    pub fn command_with_args(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        args: Value,
    ) -> Self {
        self.manifest.commands.push(CommandSpec {
            name: name.into(),
            description: description.into(),
            args: Some(args),
        });
        self
    }

    pub fn widget(mut self, id: impl Into<String>, module: impl Into<String>, default: bool) -> Self {
        self.manifest.widgets.push(WidgetSpec {
            id: id.into(),
            module: module.into(),
            class: None,
            label: None,
            default,
        });
        self
    }

    /// Add a fully specified widget.
    pub fn widget_spec(mut self, widget: WidgetSpec) -> Self {
        self.manifest.widgets.push(widget);
        self
    }

    pub fn build(self) -> AgentManifest {
        self.manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_preserves_order() {
        let manifest = ManifestBuilder::new("science")
            .description("Scientific article search")
            .command_with_args("search", "Search arXiv", json!({"query": "str"}))
            .command("tags", "List all tags")
            .widget("library", "browser", false)
            .widget("chat", "chat", true)
            .build();

        let names: Vec<_> = manifest.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["search", "tags"]);
        assert_eq!(manifest.commands[0].args, Some(json!({"query": "str"})));
        assert!(manifest.commands[1].args.is_none());

        let reg = AgentRegistration::from_manifest("science-0", manifest);
        assert_eq!(reg.default_widget().map(|w| w.id.as_str()), Some("chat"));
        assert!(reg.has_command("tags"));
        assert!(!reg.has_command("import"));
    }

    #[test]
    fn test_manifest_minimal_wire_form() {
        let manifest: AgentManifest = serde_json::from_value(json!({"name": "echo"})).unwrap();
        assert_eq!(manifest.name, "echo");
        assert!(manifest.commands.is_empty());
        assert!(manifest.widgets.is_empty());
    }

    #[test]
    fn test_manifest_accepts_panels_alias() {
        let manifest: AgentManifest = serde_json::from_value(json!({
            "name": "notes",
            "panels": [{"id": "chat", "label": "Notes", "module": "chat", "default": true}]
        }))
        .unwrap();
        assert_eq!(manifest.widgets.len(), 1);
        assert!(manifest.widgets[0].default);
        assert_eq!(manifest.widgets[0].label.as_deref(), Some("Notes"));
    }

    #[test]
    fn test_widget_default_flag_omitted_when_false() {
        let widget = WidgetSpec {
            id: "topics".into(),
            module: "browser".into(),
            class: None,
            label: None,
            default: false,
        };
        let value = serde_json::to_value(&widget).unwrap();
        assert_eq!(value, json!({"id": "topics", "module": "browser"}));
    }
}
