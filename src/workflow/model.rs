//! Workplan Data Model
//!
//! Immutable graph definitions: places, steps and the ordered connectors
//! between them. A definition is created once and shared (`Arc<Workplan>`)
//! by every engine instance that executes it.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: housing_assembly
//! version: 2
//! places:
//!   - id: start
//!     role: start
//!   - id: left
//!   - id: right
//!   - id: mounted_left
//!   - id: mounted_right
//!   - id: done
//!     role: end
//!     classification: Success
//! steps:
//!   - id: fan_out
//!     kind: split
//!     inputs: [start]
//!     outputs: [left, right]
//!   - id: mount_left
//!     kind: task
//!     activity: mount_bracket
//!     inputs: [left]
//!     outputs: [mounted_left]
//!   - id: mount_right
//!     kind: pass
//!     inputs: [right]
//!     outputs: [mounted_right]
//!   - id: fan_in
//!     kind: join
//!     inputs: [mounted_left, mounted_right]
//!     outputs: [done]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Role of a place within its workplan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaceRole {
    /// Intermediate place
    #[default]
    Normal,
    /// Receives the start token
    Start,
    /// Terminal result place; a token arriving here completes the engine
    End,
}

/// Descriptor of a place in the graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlaceDef {
    /// Stable identifier, unique within the workplan
    pub id: String,

    #[serde(default)]
    pub role: PlaceRole,

    /// Optional result label such as "Success" or "Failure"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
}

impl PlaceDef {
    /// Creates an intermediate place.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            role: PlaceRole::Normal,
            classification: None,
        }
    }

    /// Creates the start place.
    pub fn start(id: impl Into<String>) -> Self {
        Self {
            role: PlaceRole::Start,
            ..Self::new(id)
        }
    }

    /// Creates a terminal result place.
    pub fn end(id: impl Into<String>) -> Self {
        Self {
            role: PlaceRole::End,
            ..Self::new(id)
        }
    }

    /// Sets the classification label.
    pub fn with_classification(mut self, label: impl Into<String>) -> Self {
        self.classification = Some(label.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.role == PlaceRole::End
    }
}

/// What a step does once instantiated as a live transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Forwards the token unchanged to `output`
    Pass {
        #[serde(default)]
        output: usize,
    },
    /// Fans one token out to every output
    Split,
    /// Recombines the siblings of one split
    Join,
    /// Runs a nested workplan as a single atomic step
    SubWorkflow {
        workplan: Arc<Workplan>,
        /// Child terminal place id or classification -> output index
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        results: BTreeMap<String, usize>,
    },
    /// Hands the token to an external activity and waits for its result
    Task { activity: String },
}

impl StepKind {
    /// Short name of the kind, as written in YAML.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pass { .. } => "pass",
            Self::Split => "split",
            Self::Join => "join",
            Self::SubWorkflow { .. } => "sub_workflow",
            Self::Task { .. } => "task",
        }
    }
}

/// Descriptor of a transition bound to its connectors.
///
/// `inputs` and `outputs` are ordered: output 0 is the primary path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepDef {
    pub id: String,

    /// Display name (defaults to the id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,

    #[serde(flatten)]
    pub kind: StepKind,
}

impl StepDef {
    /// Creates a step of the given kind without connectors.
    ///
    /// # Example
    ///
    /// ```
    /// use workplan::workflow::StepDef;
    ///
    /// let step = StepDef::split("fan_out")
    ///     .with_input("start")
    ///     .with_output("left")
    ///     .with_output("right");
    /// assert_eq!(step.outputs.len(), 2);
    /// ```
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            kind,
        }
    }

    pub fn pass(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Pass { output: 0 })
    }

    /// Pass-through that forwards to a specific output index.
    pub fn pass_to(id: impl Into<String>, output: usize) -> Self {
        Self::new(id, StepKind::Pass { output })
    }

    pub fn split(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Split)
    }

    pub fn join(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Join)
    }

    pub fn task(id: impl Into<String>, activity: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Task {
                activity: activity.into(),
            },
        )
    }

    pub fn sub_workflow(id: impl Into<String>, workplan: Arc<Workplan>) -> Self {
        Self::new(
            id,
            StepKind::SubWorkflow {
                workplan,
                results: BTreeMap::new(),
            },
        )
    }

    /// Maps a child terminal place (or classification) to an output index.
    ///
    /// Has no effect on steps that are not sub-workflows.
    pub fn with_result(mut self, child: impl Into<String>, output: usize) -> Self {
        if let StepKind::SubWorkflow { results, .. } = &mut self.kind {
            results.insert(child.into(), output);
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Appends an input connector.
    pub fn with_input(mut self, place: impl Into<String>) -> Self {
        self.inputs.push(place.into());
        self
    }

    /// Appends an output connector.
    pub fn with_output(mut self, place: impl Into<String>) -> Self {
        self.outputs.push(place.into());
        self
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A complete, immutable workplan definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workplan {
    pub id: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub places: Vec<PlaceDef>,

    #[serde(default)]
    pub steps: Vec<StepDef>,
}

fn default_version() -> u32 {
    1
}

impl Workplan {
    /// Creates an empty workplan.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            version: default_version(),
            places: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_place(mut self, place: PlaceDef) -> Self {
        self.places.push(place);
        self
    }

    pub fn with_step(mut self, step: StepDef) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a place, rejecting duplicate ids.
    pub fn add_place(&mut self, place: PlaceDef) -> std::result::Result<(), String> {
        if self.place(&place.id).is_some() {
            return Err(format!("Place '{}' already exists", place.id));
        }
        self.places.push(place);
        Ok(())
    }

    /// Adds a step, rejecting duplicate ids.
    pub fn add_step(&mut self, step: StepDef) -> std::result::Result<(), String> {
        if self.step(&step.id).is_some() {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn place(&self, id: &str) -> Option<&PlaceDef> {
        self.places.iter().find(|p| p.id == id)
    }

    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Returns the first place with the start role.
    pub fn start_place(&self) -> Option<&PlaceDef> {
        self.places.iter().find(|p| p.role == PlaceRole::Start)
    }

    /// Returns terminal places in declaration order.
    pub fn terminal_places(&self) -> Vec<&PlaceDef> {
        self.places.iter().filter(|p| p.is_terminal()).collect()
    }

    /// Steps that consume from the given place.
    pub fn consumers_of(&self, place: &str) -> Vec<&StepDef> {
        self.steps
            .iter()
            .filter(|s| s.inputs.iter().any(|p| p == place))
            .collect()
    }

    /// Distinct activities referenced by task steps, including nested ones.
    pub fn activities(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut activities = Vec::new();
        self.collect_activities(&mut seen, &mut activities);
        activities
    }

    fn collect_activities(&self, seen: &mut HashSet<String>, out: &mut Vec<String>) {
        for step in &self.steps {
            match &step.kind {
                StepKind::Task { activity } => {
                    if seen.insert(activity.clone()) {
                        out.push(activity.clone());
                    }
                }
                StepKind::SubWorkflow { workplan, .. } => workplan.collect_activities(seen, out),
                _ => {}
            }
        }
    }

    /// Content fingerprint used to pair snapshots with their definition.
    ///
    /// SHA-256 over the canonical JSON form, hex encoded.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&canonical);
        Ok(format!("{:x}", digest))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty() && self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> Workplan {
        Workplan::new("linear")
            .with_place(PlaceDef::start("start"))
            .with_place(PlaceDef::end("done").with_classification("Success"))
            .with_step(StepDef::pass("forward").with_input("start").with_output("done"))
    }

    #[test]
    fn test_place_builders() {
        let place = PlaceDef::end("rejected").with_classification("Failure");
        assert!(place.is_terminal());
        assert_eq!(place.classification.as_deref(), Some("Failure"));
        assert_eq!(PlaceDef::start(" s ").id, "s");
    }

    #[test]
    fn test_workplan_lookups() {
        let plan = linear();
        assert_eq!(plan.start_place().map(|p| p.id.as_str()), Some("start"));
        assert_eq!(plan.terminal_places().len(), 1);
        assert_eq!(plan.consumers_of("start").len(), 1);
        assert!(plan.consumers_of("done").is_empty());
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_add_duplicates_rejected() {
        let mut plan = linear();
        assert!(plan.add_place(PlaceDef::new("start")).is_err());
        assert!(plan.add_step(StepDef::split("forward")).is_err());
        assert!(plan.add_place(PlaceDef::new("extra")).is_ok());
    }

    #[test]
    fn test_with_result_only_for_sub_workflows() {
        let child = Arc::new(linear());
        let step = StepDef::sub_workflow("nested", child).with_result("Success", 0);
        match &step.kind {
            StepKind::SubWorkflow { results, .. } => assert_eq!(results.get("Success"), Some(&0)),
            other => panic!("unexpected kind {:?}", other),
        }

        let pass = StepDef::pass("p").with_result("Success", 0);
        assert_eq!(pass.kind, StepKind::Pass { output: 0 });
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = linear();
        let b = linear();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        let changed = linear().with_version(2);
        assert_ne!(a.fingerprint().unwrap(), changed.fingerprint().unwrap());
    }

    #[test]
    fn test_activities_include_nested() {
        let child = Workplan::new("child")
            .with_place(PlaceDef::start("s"))
            .with_place(PlaceDef::end("e"))
            .with_step(StepDef::task("inspect", "inspect_weld").with_input("s").with_output("e"));
        let parent = Workplan::new("parent")
            .with_place(PlaceDef::start("s"))
            .with_place(PlaceDef::new("m"))
            .with_place(PlaceDef::end("e"))
            .with_step(StepDef::task("weld", "weld_seam").with_input("s").with_output("m"))
            .with_step(StepDef::sub_workflow("check", Arc::new(child)).with_input("m").with_output("e"));

        assert_eq!(parent.activities(), vec!["weld_seam", "inspect_weld"]);
    }

    #[test]
    fn test_step_kind_yaml_shape() {
        let yaml = "id: skip\nkind: pass\noutput: 1\ninputs: [a]\noutputs: [b, c]\n";
        let step: StepDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.kind, StepKind::Pass { output: 1 });
        assert_eq!(step.display_name(), "skip");
    }
}
