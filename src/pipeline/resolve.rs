//! Stage resolution: turn a stage descriptor into a ready instance.
//!
//! Every stage kind (builder, processor, renderer) describes itself with a
//! [`StageSpec`]: its name, category, failure policy and the named
//! dependencies it needs. The [`Resolver`] satisfies each dependency by
//! looking, in order, at
//!
//! 1. the [`ArtifactBag`] (loaded models, the LLM service handle),
//! 2. the run configuration's free-form `options` map,
//! 3. the default the stage declared.
//!
//! A required dependency with none of the three is a
//! [`ConvertError::MissingDependency`]. Resolution never mutates the bag.

use crate::builders::{LayoutModel, OcrModel};
use crate::config::PipelineConfig;
use crate::error::ConvertError;
use crate::services::LlmService;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Bag key under which the resolved LLM service is installed.
pub const LLM_SERVICE: &str = "llm_service";

/// Bag key of the layout model artifact.
pub const LAYOUT_MODEL: &str = "layout_model";

/// Bag key of the OCR model artifact.
pub const OCR_MODEL: &str = "ocr_model";

/// Which part of the pipeline a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCategory {
    Builder,
    Processor,
    Renderer,
}

impl fmt::Display for StageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageCategory::Builder => "builder",
            StageCategory::Processor => "processor",
            StageCategory::Renderer => "renderer",
        })
    }
}

/// What the chain driver does when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the whole conversion.
    Abort,
    /// Log a warning, discard the stage's changes and continue.
    Skip,
}

/// A loaded resource stages can depend on.
#[derive(Clone)]
pub enum Artifact {
    LayoutModel(Arc<dyn LayoutModel>),
    OcrModel(Arc<dyn OcrModel>),
    Llm(Arc<dyn LlmService>),
    Value(serde_json::Value),
}

impl Artifact {
    fn kind(&self) -> &'static str {
        match self {
            Artifact::LayoutModel(_) => "layout model",
            Artifact::OcrModel(_) => "OCR model",
            Artifact::Llm(_) => "LLM service",
            Artifact::Value(_) => "value",
        }
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::LayoutModel(m) => write!(f, "LayoutModel({})", m.name()),
            Artifact::OcrModel(m) => write!(f, "OcrModel({})", m.name()),
            Artifact::Llm(s) => write!(f, "Llm({})", s.name()),
            Artifact::Value(v) => write!(f, "Value({v})"),
        }
    }
}

/// Shared, read-only collection of loaded artifacts.
///
/// Cloning is cheap: entries are reference counted. The only write after
/// construction is [`ArtifactBag::install_llm`], which succeeds once.
#[derive(Clone, Default)]
pub struct ArtifactBag {
    entries: HashMap<String, Artifact>,
    llm: OnceCell<Arc<dyn LlmService>>,
}

impl fmt::Debug for ArtifactBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("ArtifactBag")
            .field("entries", &keys)
            .field("llm", &self.llm.get().map(|s| s.name().to_string()))
            .finish()
    }
}

impl ArtifactBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bag holding the bundled heuristic layout model.
    pub fn with_default_models() -> Self {
        Self::new().with(
            LAYOUT_MODEL,
            Artifact::LayoutModel(Arc::new(crate::builders::HeuristicLayoutModel::default())),
        )
    }

    pub fn with(mut self, name: impl Into<String>, artifact: Artifact) -> Self {
        self.entries.insert(name.into(), artifact);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, artifact: Artifact) {
        self.entries.insert(name.into(), artifact);
    }

    pub fn get(&self, name: &str) -> Option<Artifact> {
        if name == LLM_SERVICE {
            if let Some(service) = self.llm.get() {
                return Some(Artifact::Llm(Arc::clone(service)));
            }
        }
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Install the resolved LLM service. Fails if one is already installed.
    pub fn install_llm(&self, service: Arc<dyn LlmService>) -> Result<(), ConvertError> {
        self.llm.set(service).map_err(|_| {
            ConvertError::Internal("LLM service already installed for this converter".into())
        })
    }

    pub fn llm(&self) -> Option<Arc<dyn LlmService>> {
        self.llm.get().cloned()
    }
}

/// One named dependency of a stage.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: &'static str,
    pub required: bool,
    pub default: Option<serde_json::Value>,
}

impl Dependency {
    /// Must be found in the bag or the options.
    pub fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
            default: None,
        }
    }

    /// May be absent.
    pub fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
            default: None,
        }
    }

    /// Falls back to `default` when neither the bag nor the options have it.
    pub fn with_default(name: &'static str, default: serde_json::Value) -> Self {
        Self {
            name,
            required: false,
            default: Some(default),
        }
    }
}

/// Static description of a stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: &'static str,
    pub category: StageCategory,
    pub failure_policy: FailurePolicy,
    pub dependencies: Vec<Dependency>,
}

impl StageSpec {
    pub fn new(name: &'static str, category: StageCategory, failure_policy: FailurePolicy) -> Self {
        Self {
            name,
            category,
            failure_policy,
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// Something the [`Resolver`] can turn into a stage instance.
pub trait StageDescriptor {
    type Stage;

    fn spec(&self) -> StageSpec;

    fn instantiate(
        &self,
        deps: ResolvedDeps,
        config: &PipelineConfig,
    ) -> Result<Self::Stage, ConvertError>;
}

/// Dependencies found for one stage, keyed by dependency name.
#[derive(Debug)]
pub struct ResolvedDeps {
    stage: &'static str,
    found: HashMap<&'static str, Artifact>,
}

impl ResolvedDeps {
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.found.get(name)
    }

    fn wrong_kind(&self, name: &str, wanted: &str, got: &Artifact) -> ConvertError {
        ConvertError::config(format!(
            "stage '{}' expects '{name}' to be a {wanted}, got a {}",
            self.stage,
            got.kind()
        ))
    }

    fn missing(&self, name: &str) -> ConvertError {
        ConvertError::MissingDependency {
            stage: self.stage.to_string(),
            dependency: name.to_string(),
        }
    }

    pub fn layout_model(&self, name: &str) -> Result<Arc<dyn LayoutModel>, ConvertError> {
        match self.found.get(name) {
            Some(Artifact::LayoutModel(m)) => Ok(Arc::clone(m)),
            Some(other) => Err(self.wrong_kind(name, "layout model", other)),
            None => Err(self.missing(name)),
        }
    }

    pub fn ocr_model(&self, name: &str) -> Result<Option<Arc<dyn OcrModel>>, ConvertError> {
        match self.found.get(name) {
            Some(Artifact::OcrModel(m)) => Ok(Some(Arc::clone(m))),
            Some(other) => Err(self.wrong_kind(name, "OCR model", other)),
            None => Ok(None),
        }
    }

    /// The LLM service, if one was resolved.
    pub fn llm(&self) -> Option<Arc<dyn LlmService>> {
        match self.found.get(LLM_SERVICE) {
            Some(Artifact::Llm(s)) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        match self.found.get(name) {
            Some(Artifact::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn f32(&self, name: &str) -> Result<f32, ConvertError> {
        let v = self.value(name).ok_or_else(|| self.missing(name))?;
        v.as_f64()
            .map(|x| x as f32)
            .ok_or_else(|| ConvertError::config(format!("option '{name}' must be a number, got {v}")))
    }

    pub fn usize(&self, name: &str) -> Result<usize, ConvertError> {
        let v = self.value(name).ok_or_else(|| self.missing(name))?;
        v.as_u64()
            .map(|x| x as usize)
            .ok_or_else(|| {
                ConvertError::config(format!("option '{name}' must be a non-negative integer, got {v}"))
            })
    }

    pub fn bool(&self, name: &str) -> Result<bool, ConvertError> {
        let v = self.value(name).ok_or_else(|| self.missing(name))?;
        v.as_bool()
            .ok_or_else(|| ConvertError::config(format!("option '{name}' must be a boolean, got {v}")))
    }

    pub fn string(&self, name: &str) -> Result<String, ConvertError> {
        let v = self.value(name).ok_or_else(|| self.missing(name))?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| ConvertError::config(format!("option '{name}' must be a string, got {v}")))
    }
}

/// Builds stage instances from descriptors against one bag and config.
pub struct Resolver<'a> {
    bag: &'a ArtifactBag,
    config: &'a PipelineConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(bag: &'a ArtifactBag, config: &'a PipelineConfig) -> Self {
        Self { bag, config }
    }

    /// Look up every declared dependency without constructing the stage.
    pub fn dependencies(&self, spec: &StageSpec) -> Result<ResolvedDeps, ConvertError> {
        let mut found = HashMap::new();
        for dep in &spec.dependencies {
            let artifact = self
                .bag
                .get(dep.name)
                .or_else(|| self.config.option(dep.name).cloned().map(Artifact::Value))
                .or_else(|| dep.default.clone().map(Artifact::Value));
            match artifact {
                Some(a) => {
                    found.insert(dep.name, a);
                }
                None if dep.required => {
                    return Err(ConvertError::MissingDependency {
                        stage: spec.name.to_string(),
                        dependency: dep.name.to_string(),
                    })
                }
                None => {}
            }
        }
        Ok(ResolvedDeps {
            stage: spec.name,
            found,
        })
    }

    pub fn resolve<D: StageDescriptor>(&self, descriptor: &D) -> Result<D::Stage, ConvertError> {
        let spec = descriptor.spec();
        let deps = self.dependencies(&spec)?;
        descriptor.instantiate(deps, self.config)
    }

    /// Resolve an ordered list; instances come back in the same order.
    pub fn resolve_all<D: StageDescriptor>(
        &self,
        descriptors: &[D],
    ) -> Result<Vec<D::Stage>, ConvertError> {
        descriptors.iter().map(|d| self.resolve(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Probe {
        deps: Vec<Dependency>,
    }

    impl StageDescriptor for Probe {
        type Stage = (f32, bool);

        fn spec(&self) -> StageSpec {
            let mut spec = StageSpec::new("probe", StageCategory::Processor, FailurePolicy::Abort);
            spec.dependencies = self.deps.clone();
            spec
        }

        fn instantiate(
            &self,
            deps: ResolvedDeps,
            _config: &PipelineConfig,
        ) -> Result<Self::Stage, ConvertError> {
            Ok((deps.f32("threshold")?, deps.get("extra").is_some()))
        }
    }

    #[test]
    fn lookup_order_is_bag_then_options_then_default() {
        let probe = Probe {
            deps: vec![
                Dependency::with_default("threshold", json!(0.5)),
                Dependency::optional("extra"),
            ],
        };
        let config = PipelineConfig::default();
        let bag = ArtifactBag::new();
        assert_eq!(Resolver::new(&bag, &config).resolve(&probe).unwrap(), (0.5, false));

        let config = PipelineConfig::builder()
            .option("threshold", json!(0.25))
            .build()
            .unwrap();
        assert_eq!(Resolver::new(&bag, &config).resolve(&probe).unwrap(), (0.25, false));

        let bag = ArtifactBag::new()
            .with("threshold", Artifact::Value(json!(0.75)))
            .with("extra", Artifact::Value(json!(true)));
        assert_eq!(Resolver::new(&bag, &config).resolve(&probe).unwrap(), (0.75, true));
    }

    #[test]
    fn missing_required_dependency_names_it() {
        let probe = Probe {
            deps: vec![Dependency::required("threshold")],
        };
        let config = PipelineConfig::default();
        let bag = ArtifactBag::new();
        match Resolver::new(&bag, &config).resolve(&probe) {
            Err(ConvertError::MissingDependency { stage, dependency }) => {
                assert_eq!(stage, "probe");
                assert_eq!(dependency, "threshold");
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[test]
    fn wrong_value_type_is_configuration_error() {
        let probe = Probe {
            deps: vec![Dependency::required("threshold")],
        };
        let config = PipelineConfig::builder()
            .option("threshold", json!("high"))
            .build()
            .unwrap();
        let bag = ArtifactBag::new();
        assert!(matches!(
            Resolver::new(&bag, &config).resolve(&probe),
            Err(ConvertError::Configuration(_))
        ));
    }

    #[test]
    fn resolve_all_preserves_order() {
        let a = Probe {
            deps: vec![Dependency::with_default("threshold", json!(1.0))],
        };
        let b = Probe {
            deps: vec![
                Dependency::with_default("threshold", json!(2.0)),
                Dependency::with_default("extra", json!(1)),
            ],
        };
        let config = PipelineConfig::default();
        let bag = ArtifactBag::new();
        let out = Resolver::new(&bag, &config).resolve_all(&[a, b]).unwrap();
        assert_eq!(out, vec![(1.0, false), (2.0, true)]);
    }

    #[test]
    fn llm_slot_is_set_once() {
        let bag = ArtifactBag::new();
        assert!(bag.llm().is_none());
        assert!(!bag.contains(LLM_SERVICE));
        let stub: Arc<dyn LlmService> = Arc::new(crate::services::StaticService::new("ok"));
        bag.install_llm(Arc::clone(&stub)).unwrap();
        assert!(bag.contains(LLM_SERVICE));
        assert!(bag.install_llm(stub).is_err());
    }

    #[test]
    fn default_models_include_layout() {
        assert!(ArtifactBag::with_default_models().contains(LAYOUT_MODEL));
    }
}
