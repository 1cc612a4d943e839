/*
 * Taint models
 *
 * Two product compositions built from the reusable domain combinators:
 *
 * - `TaintElement`: what one value carries. Taint kinds (strict: no
 *   kinds means no taint, whatever else the element claims), breadcrumbs
 *   describing how the taint travelled, and the access paths under which
 *   it reaches the return value.
 *
 * - `Model`: what one callable means to its callers. A source tree over
 *   the return value, per-parameter sink trees, per-parameter
 *   taint-in-taint-out trees, and analysis modes.
 *
 * Both declare closed slot/part enums and a route table built once, so
 * generic traversal dispatches through typed unions instead of casts.
 */

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use taintflow_domains::{
    AbstractDomain, AccessPath, ComplexFeatureSet, DomainSketch, PartKey, ProductDomain,
    RouteTable, SimpleFeatureSet, SlotKey, TreeDomain, WideningContext,
};

/// Named taint kind, e.g. `UserControlled` or `Sql`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaintKind(String);

impl TaintKind {
    pub fn new(name: impl Into<String>) -> Self {
        TaintKind(name.into())
    }

    /// Reserved kind attached to flows into callables the engine cannot
    /// see into. Names in angle brackets are rejected for user kinds.
    pub fn obscure() -> Self {
        TaintKind("<obscure>".to_string())
    }

    pub fn is_obscure(&self) -> bool {
        self.0 == "<obscure>"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provenance marker accumulated while taint travels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Breadcrumb(String);

impl Breadcrumb {
    pub fn new(name: impl Into<String>) -> Self {
        Breadcrumb(name.into())
    }

    /// Marks taint that passed through an obscure callable.
    pub fn via_obscure() -> Self {
        Breadcrumb("via-obscure".to_string())
    }

    /// Marks a parameter-to-return passthrough. Every tito tree carries
    /// it so that pure passthrough (no other breadcrumbs) stays
    /// distinguishable from bottom.
    pub fn tito() -> Self {
        Breadcrumb("tito".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Breadcrumb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Analysis mode attached to a callable's model.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Mode {
    /// No body available; calls are summarized pessimistically.
    Obscure,
    /// Body exists but must not be analyzed; the user model is final.
    SkipAnalysis,
}

/// Taint tree over values: access paths to taint elements.
pub type TaintTree = TreeDomain<TaintElement>;

/// Passthrough tree: access paths of a parameter that reach the return
/// value, with breadcrumbs collected on the way.
pub type TitoTree = TreeDomain<SimpleFeatureSet<Breadcrumb>>;

/// Leaf passthrough tree carrying the tito marker plus `extra`.
pub fn tito_passthrough(extra: &[Breadcrumb]) -> TitoTree {
    let mut breadcrumbs = SimpleFeatureSet::singleton(Breadcrumb::tito());
    for breadcrumb in extra {
        breadcrumbs.add(breadcrumb.clone());
    }
    TitoTree::create_leaf(breadcrumbs)
}

// ───────────────────────── TaintElement ─────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSlot {
    Kinds,
    Breadcrumbs,
    ReturnPaths,
}

impl SlotKey for ElementSlot {
    const ALL: &'static [Self] = &[Self::Kinds, Self::Breadcrumbs, Self::ReturnPaths];

    fn index(self) -> usize {
        match self {
            Self::Kinds => 0,
            Self::Breadcrumbs => 1,
            Self::ReturnPaths => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Kinds => "kinds",
            Self::Breadcrumbs => "breadcrumbs",
            Self::ReturnPaths => "return-paths",
        }
    }

    fn is_strict(self) -> bool {
        matches!(self, Self::Kinds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementPart {
    Kind,
    Breadcrumb,
    ReturnPath,
}

impl PartKey for ElementPart {
    const ALL: &'static [Self] = &[Self::Kind, Self::Breadcrumb, Self::ReturnPath];

    fn index(self) -> usize {
        match self {
            Self::Kind => 0,
            Self::Breadcrumb => 1,
            Self::ReturnPath => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Kind => "kind",
            Self::Breadcrumb => "breadcrumb",
            Self::ReturnPath => "return-path",
        }
    }
}

static ELEMENT_ROUTES: Lazy<RouteTable<ElementPart, ElementSlot>> = Lazy::new(|| {
    RouteTable::builder()
        .route(ElementPart::Kind, ElementSlot::Kinds)
        .route(ElementPart::Breadcrumb, ElementSlot::Breadcrumbs)
        .route(ElementPart::ReturnPath, ElementSlot::ReturnPaths)
        .build()
});

/// Typed value crossing the element's generic update boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementValue {
    Kinds(SimpleFeatureSet<TaintKind>),
    Breadcrumbs(SimpleFeatureSet<Breadcrumb>),
    ReturnPaths(ComplexFeatureSet<AccessPath>),
}

/// Typed item crossing the element's generic traversal boundary: one
/// entry of the slot owning the traversed part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementItem {
    Kind(TaintKind),
    Breadcrumb(Breadcrumb),
    ReturnPath(AccessPath),
}

/// Taint carried by one abstract value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintElement {
    kinds: SimpleFeatureSet<TaintKind>,
    breadcrumbs: SimpleFeatureSet<Breadcrumb>,
    return_paths: ComplexFeatureSet<AccessPath>,
}

impl TaintElement {
    pub fn of_kind(kind: TaintKind) -> Self {
        Self {
            kinds: SimpleFeatureSet::singleton(kind),
            ..Self::default()
        }
    }

    pub fn with_breadcrumb(mut self, breadcrumb: Breadcrumb) -> Self {
        self.add_breadcrumb(breadcrumb);
        self
    }

    pub fn with_return_path(mut self, path: AccessPath) -> Self {
        if !self.is_bottom() {
            self.return_paths.add(path);
        }
        self
    }

    pub fn kinds(&self) -> &SimpleFeatureSet<TaintKind> {
        &self.kinds
    }

    pub fn breadcrumbs(&self) -> &SimpleFeatureSet<Breadcrumb> {
        &self.breadcrumbs
    }

    pub fn return_paths(&self) -> &ComplexFeatureSet<AccessPath> {
        &self.return_paths
    }

    /// Attach a breadcrumb. No-op on bottom: breadcrumbs never exist
    /// without a kind.
    pub fn add_breadcrumb(&mut self, breadcrumb: Breadcrumb) {
        if !self.is_bottom() {
            self.breadcrumbs.add(breadcrumb);
        }
    }

    pub fn has_kind(&self, kind: &TaintKind) -> bool {
        self.kinds.contains(kind)
    }

    /// Replace one slot's value, re-checking strictness.
    pub fn update(&mut self, value: ElementValue) {
        match value {
            ElementValue::Kinds(kinds) => self.kinds = kinds,
            ElementValue::Breadcrumbs(breadcrumbs) => self.breadcrumbs = breadcrumbs,
            ElementValue::ReturnPaths(return_paths) => self.return_paths = return_paths,
        }
        self.enforce_strictness();
    }

    pub fn slot_for_part(part: ElementPart) -> ElementSlot {
        ELEMENT_ROUTES.slot_for(part)
    }

    /// Rewrite every item of `part` in place, dispatching through the
    /// route table into the owning slot's visitor.
    ///
    /// # Panics
    ///
    /// If `f` returns an item belonging to a different part.
    pub fn transform(&mut self, part: ElementPart, mut f: impl FnMut(ElementItem) -> ElementItem) {
        match Self::slot_for_part(part) {
            ElementSlot::Kinds => {
                self.kinds
                    .transform_elements(|kind| match f(ElementItem::Kind(kind)) {
                        ElementItem::Kind(kind) => kind,
                        other => panic!("transform over {:?} produced {:?}", part, other),
                    })
            }
            ElementSlot::Breadcrumbs => self.breadcrumbs.transform_elements(|breadcrumb| {
                match f(ElementItem::Breadcrumb(breadcrumb)) {
                    ElementItem::Breadcrumb(breadcrumb) => breadcrumb,
                    other => panic!("transform over {:?} produced {:?}", part, other),
                }
            }),
            ElementSlot::ReturnPaths => self.return_paths.transform_elements(|path| {
                match f(ElementItem::ReturnPath(path)) {
                    ElementItem::ReturnPath(path) => path,
                    other => panic!("transform over {:?} produced {:?}", part, other),
                }
            }),
        }
        self.enforce_strictness();
    }

    /// Fold over every item of `part`.
    pub fn fold<B>(
        &self,
        part: ElementPart,
        init: B,
        mut f: impl FnMut(B, ElementItem) -> B,
    ) -> B {
        match Self::slot_for_part(part) {
            ElementSlot::Kinds => self
                .kinds
                .fold_elements(init, |acc, kind| f(acc, ElementItem::Kind(kind.clone()))),
            ElementSlot::Breadcrumbs => self.breadcrumbs.fold_elements(init, |acc, breadcrumb| {
                f(acc, ElementItem::Breadcrumb(breadcrumb.clone()))
            }),
            ElementSlot::ReturnPaths => self.return_paths.fold_elements(init, |acc, path| {
                f(acc, ElementItem::ReturnPath(path.clone()))
            }),
        }
    }

    /// Split by a key over `part`'s items. Every partition keeps the
    /// other slots unchanged, so joining all partitions restores the
    /// original; an empty part yields no partitions.
    pub fn partition<K: Ord>(
        &self,
        part: ElementPart,
        mut key_of: impl FnMut(&ElementItem) -> K,
    ) -> BTreeMap<K, Self> {
        match Self::slot_for_part(part) {
            ElementSlot::Kinds => self
                .kinds
                .partition_elements(|kind| key_of(&ElementItem::Kind(kind.clone())))
                .into_iter()
                .map(|(key, kinds)| {
                    let mut piece = self.clone();
                    piece.update(ElementValue::Kinds(kinds));
                    (key, piece)
                })
                .collect(),
            ElementSlot::Breadcrumbs => self
                .breadcrumbs
                .partition_elements(|breadcrumb| {
                    key_of(&ElementItem::Breadcrumb(breadcrumb.clone()))
                })
                .into_iter()
                .map(|(key, breadcrumbs)| {
                    let mut piece = self.clone();
                    piece.update(ElementValue::Breadcrumbs(breadcrumbs));
                    (key, piece)
                })
                .collect(),
            ElementSlot::ReturnPaths => self
                .return_paths
                .partition_elements(|path| key_of(&ElementItem::ReturnPath(path.clone())))
                .into_iter()
                .map(|(key, return_paths)| {
                    let mut piece = self.clone();
                    piece.update(ElementValue::ReturnPaths(return_paths));
                    (key, piece)
                })
                .collect(),
        }
    }
}

impl AbstractDomain for TaintElement {
    fn bottom() -> Self {
        Self::default()
    }

    fn is_bottom(&self) -> bool {
        // Kinds are strict, so they alone decide.
        self.kinds.is_bottom()
    }

    fn join_with(&mut self, other: &Self) {
        self.kinds.join_with(&other.kinds);
        self.breadcrumbs.join_with(&other.breadcrumbs);
        self.return_paths.join_with(&other.return_paths);
        self.enforce_strictness();
    }

    fn widen_with(&mut self, other: &Self, ctx: &WideningContext<'_>) {
        self.kinds.widen_with(&other.kinds, ctx);
        self.breadcrumbs.widen_with(&other.breadcrumbs, ctx);
        self.return_paths.widen_with(&other.return_paths, ctx);
        self.enforce_strictness();
    }

    fn less_or_equal(&self, other: &Self) -> bool {
        if self.is_bottom() {
            return true;
        }
        self.kinds.less_or_equal(&other.kinds)
            && self.breadcrumbs.less_or_equal(&other.breadcrumbs)
            && self.return_paths.less_or_equal(&other.return_paths)
    }

    fn subtract(&mut self, to_remove: &Self) {
        self.kinds.subtract(&to_remove.kinds);
        self.breadcrumbs.subtract(&to_remove.breadcrumbs);
        self.return_paths.subtract(&to_remove.return_paths);
        self.enforce_strictness();
    }

    fn introspect(&self) -> DomainSketch {
        DomainSketch::node(
            "element",
            vec![
                DomainSketch::node("kinds", vec![self.kinds.introspect()]),
                DomainSketch::node("breadcrumbs", vec![self.breadcrumbs.introspect()]),
                DomainSketch::node("return-paths", vec![self.return_paths.introspect()]),
            ],
        )
    }
}

impl ProductDomain for TaintElement {
    type Slot = ElementSlot;

    fn slot_is_bottom(&self, slot: ElementSlot) -> bool {
        match slot {
            ElementSlot::Kinds => self.kinds.is_bottom(),
            ElementSlot::Breadcrumbs => self.breadcrumbs.is_bottom(),
            ElementSlot::ReturnPaths => self.return_paths.is_bottom(),
        }
    }
}

// ───────────────────────── ParamMap ─────────────────────────

/// Pointwise map from parameter position to a sub-domain value. Missing
/// keys read as bottom; bottom values are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamMap<D>(BTreeMap<usize, D>);

impl<D> Default for ParamMap<D> {
    fn default() -> Self {
        ParamMap(BTreeMap::new())
    }
}

impl<D: AbstractDomain> ParamMap<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, parameter: usize) -> Option<&D> {
        self.0.get(&parameter)
    }

    /// Replace the value at `parameter`. Bottom clears the entry.
    pub fn set(&mut self, parameter: usize, value: D) {
        if value.is_bottom() {
            self.0.remove(&parameter);
        } else {
            self.0.insert(parameter, value);
        }
    }

    /// Join `value` into the entry at `parameter`.
    pub fn extend_at(&mut self, parameter: usize, value: &D) {
        if value.is_bottom() {
            return;
        }
        match self.0.get_mut(&parameter) {
            Some(existing) => existing.join_with(value),
            None => {
                self.0.insert(parameter, value.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &D)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    /// Visit every entry mutably; entries left bottom are dropped.
    pub fn transform_values(&mut self, mut f: impl FnMut(usize, &mut D)) {
        for (parameter, value) in self.0.iter_mut() {
            f(*parameter, value);
        }
        self.0.retain(|_, value| !value.is_bottom());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<D: AbstractDomain> AbstractDomain for ParamMap<D> {
    fn bottom() -> Self {
        Self::default()
    }

    fn is_bottom(&self) -> bool {
        self.0.is_empty()
    }

    fn join_with(&mut self, other: &Self) {
        for (parameter, value) in &other.0 {
            self.extend_at(*parameter, value);
        }
    }

    fn widen_with(&mut self, other: &Self, ctx: &WideningContext<'_>) {
        for (parameter, value) in &other.0 {
            match self.0.get_mut(parameter) {
                Some(existing) => existing.widen_with(value, ctx),
                None => {
                    // Widen from bottom so precision limits still apply.
                    let mut fresh = D::bottom();
                    fresh.widen_with(value, ctx);
                    self.set(*parameter, fresh);
                }
            }
        }
    }

    fn less_or_equal(&self, other: &Self) -> bool {
        self.0.iter().all(|(parameter, value)| match other.0.get(parameter) {
            Some(bound) => value.less_or_equal(bound),
            None => value.is_bottom(),
        })
    }

    fn subtract(&mut self, to_remove: &Self) {
        for (parameter, value) in &to_remove.0 {
            if let Some(existing) = self.0.get_mut(parameter) {
                existing.subtract(value);
            }
        }
        self.0.retain(|_, value| !value.is_bottom());
    }

    fn introspect(&self) -> DomainSketch {
        DomainSketch::node(
            "params",
            self.0
                .iter()
                .map(|(parameter, value)| {
                    DomainSketch::node(format!("param{}", parameter), vec![value.introspect()])
                })
                .collect(),
        )
    }
}

// ───────────────────────── Model ─────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSlot {
    Sources,
    Sinks,
    Tito,
    Modes,
}

impl SlotKey for ModelSlot {
    const ALL: &'static [Self] = &[Self::Sources, Self::Sinks, Self::Tito, Self::Modes];

    fn index(self) -> usize {
        match self {
            Self::Sources => 0,
            Self::Sinks => 1,
            Self::Tito => 2,
            Self::Modes => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Sources => "sources",
            Self::Sinks => "sinks",
            Self::Tito => "tito",
            Self::Modes => "modes",
        }
    }

    fn is_strict(self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPart {
    Source,
    Sink,
    Tito,
    Mode,
}

impl PartKey for ModelPart {
    const ALL: &'static [Self] = &[Self::Source, Self::Sink, Self::Tito, Self::Mode];

    fn index(self) -> usize {
        match self {
            Self::Source => 0,
            Self::Sink => 1,
            Self::Tito => 2,
            Self::Mode => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Sink => "sink",
            Self::Tito => "tito",
            Self::Mode => "mode",
        }
    }
}

static MODEL_ROUTES: Lazy<RouteTable<ModelPart, ModelSlot>> = Lazy::new(|| {
    RouteTable::builder()
        .route(ModelPart::Source, ModelSlot::Sources)
        .route(ModelPart::Sink, ModelSlot::Sinks)
        .route(ModelPart::Tito, ModelSlot::Tito)
        .route(ModelPart::Mode, ModelSlot::Modes)
        .build()
});

/// Typed value crossing the model's generic update boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelValue {
    Sources(TaintTree),
    Sinks(ParamMap<TaintTree>),
    Tito(ParamMap<TitoTree>),
    Modes(SimpleFeatureSet<Mode>),
}

/// Typed item crossing the model's generic traversal boundary. Sink and
/// tito items carry the parameter position they belong to; tree-backed
/// items carry the tip's access path.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelItem {
    Source(AccessPath, TaintElement),
    Sink(usize, AccessPath, TaintElement),
    Tito(usize, AccessPath, SimpleFeatureSet<Breadcrumb>),
    Mode(Mode),
}

/// Everything the engine knows about one callable, as seen by callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Taint produced on the return value.
    sources: TaintTree,
    /// Taint that must not reach each parameter.
    sinks: ParamMap<TaintTree>,
    /// Parameter-to-return passthrough.
    tito: ParamMap<TitoTree>,
    /// Analysis modes.
    modes: SimpleFeatureSet<Mode>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pessimistic stand-in for a callable with no body and no user
    /// model: every parameter flows to an obscure sink and passes
    /// through to the return value.
    pub fn obscure(parameter_count: usize) -> Self {
        let mut model = Model::new();
        model.modes.add(Mode::Obscure);
        let sink = TaintTree::create_leaf(
            TaintElement::of_kind(TaintKind::obscure()).with_breadcrumb(Breadcrumb::via_obscure()),
        );
        let passthrough = tito_passthrough(&[Breadcrumb::via_obscure()]);
        for parameter in 0..parameter_count {
            model.sinks.set(parameter, sink.clone());
            model.tito.set(parameter, passthrough.clone());
        }
        model
    }

    pub fn with_sources(mut self, sources: TaintTree) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_sink(mut self, parameter: usize, sink: TaintTree) -> Self {
        self.sinks.extend_at(parameter, &sink);
        self
    }

    pub fn with_tito(mut self, parameter: usize, tito: TitoTree) -> Self {
        self.tito.extend_at(parameter, &tito);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.modes.add(mode);
        self
    }

    pub fn sources(&self) -> &TaintTree {
        &self.sources
    }

    pub fn sinks(&self) -> &ParamMap<TaintTree> {
        &self.sinks
    }

    pub fn tito(&self) -> &ParamMap<TitoTree> {
        &self.tito
    }

    pub fn modes(&self) -> &SimpleFeatureSet<Mode> {
        &self.modes
    }

    pub fn has_mode(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }

    /// Join additional taint into the return sources.
    pub fn extend_sources(&mut self, sources: &TaintTree) {
        self.sources.join_with(sources);
    }

    /// Join an additional sink tree into one parameter.
    pub fn extend_sink(&mut self, parameter: usize, sink: &TaintTree) {
        self.sinks.extend_at(parameter, sink);
    }

    /// Join additional passthrough entries, parameter by parameter.
    pub fn extend_tito_map(&mut self, tito: &ParamMap<TitoTree>) {
        self.tito.join_with(tito);
    }

    /// Replace one slot's value, re-checking strictness.
    pub fn update(&mut self, value: ModelValue) {
        match value {
            ModelValue::Sources(sources) => self.sources = sources,
            ModelValue::Sinks(sinks) => self.sinks = sinks,
            ModelValue::Tito(tito) => self.tito = tito,
            ModelValue::Modes(modes) => self.modes = modes,
        }
        self.enforce_strictness();
    }

    pub fn slot_for_part(part: ModelPart) -> ModelSlot {
        MODEL_ROUTES.slot_for(part)
    }

    /// Rewrite every item of `part` in place, dispatching through the
    /// route table into the owning slot's visitor. Tip paths are context
    /// only; items stay where they are.
    ///
    /// # Panics
    ///
    /// If `f` returns an item belonging to a different part.
    pub fn transform(&mut self, part: ModelPart, mut f: impl FnMut(ModelItem) -> ModelItem) {
        match Self::slot_for_part(part) {
            ModelSlot::Sources => self.sources.transform_tips(|path, element| {
                match f(ModelItem::Source(path.clone(), element)) {
                    ModelItem::Source(_, element) => element,
                    other => panic!("transform over {:?} produced {:?}", part, other),
                }
            }),
            ModelSlot::Sinks => self.sinks.transform_values(|parameter, tree| {
                tree.transform_tips(|path, element| {
                    match f(ModelItem::Sink(parameter, path.clone(), element)) {
                        ModelItem::Sink(_, _, element) => element,
                        other => panic!("transform over {:?} produced {:?}", part, other),
                    }
                })
            }),
            ModelSlot::Tito => self.tito.transform_values(|parameter, tree| {
                tree.transform_tips(|path, breadcrumbs| {
                    match f(ModelItem::Tito(parameter, path.clone(), breadcrumbs)) {
                        ModelItem::Tito(_, _, breadcrumbs) => breadcrumbs,
                        other => panic!("transform over {:?} produced {:?}", part, other),
                    }
                })
            }),
            ModelSlot::Modes => {
                self.modes
                    .transform_elements(|mode| match f(ModelItem::Mode(mode)) {
                        ModelItem::Mode(mode) => mode,
                        other => panic!("transform over {:?} produced {:?}", part, other),
                    })
            }
        }
        self.enforce_strictness();
    }

    /// Fold over every item of `part`.
    pub fn fold<B>(&self, part: ModelPart, init: B, mut f: impl FnMut(B, ModelItem) -> B) -> B {
        match Self::slot_for_part(part) {
            ModelSlot::Sources => self.sources.fold_tips(init, |acc, path, element| {
                f(acc, ModelItem::Source(path.clone(), element.clone()))
            }),
            ModelSlot::Sinks => {
                let mut acc = init;
                for (parameter, tree) in self.sinks.iter() {
                    acc = tree.fold_tips(acc, |acc, path, element| {
                        f(acc, ModelItem::Sink(parameter, path.clone(), element.clone()))
                    });
                }
                acc
            }
            ModelSlot::Tito => {
                let mut acc = init;
                for (parameter, tree) in self.tito.iter() {
                    acc = tree.fold_tips(acc, |acc, path, breadcrumbs| {
                        f(acc, ModelItem::Tito(parameter, path.clone(), breadcrumbs.clone()))
                    });
                }
                acc
            }
            ModelSlot::Modes => self
                .modes
                .fold_elements(init, |acc, mode| f(acc, ModelItem::Mode(*mode))),
        }
    }

    /// Split by a key over `part`'s items. Every partition keeps the
    /// other slots unchanged, so joining all partitions restores the
    /// original; an empty part yields no partitions.
    pub fn partition<K: Ord>(
        &self,
        part: ModelPart,
        mut key_of: impl FnMut(&ModelItem) -> K,
    ) -> BTreeMap<K, Self> {
        match Self::slot_for_part(part) {
            ModelSlot::Sources => self
                .sources
                .partition_tips(|path, element| {
                    key_of(&ModelItem::Source(path.clone(), element.clone()))
                })
                .into_iter()
                .map(|(key, sources)| {
                    let mut piece = self.clone();
                    piece.update(ModelValue::Sources(sources));
                    (key, piece)
                })
                .collect(),
            ModelSlot::Sinks => {
                let mut grouped: BTreeMap<K, ParamMap<TaintTree>> = BTreeMap::new();
                for (parameter, tree) in self.sinks.iter() {
                    let pieces = tree.partition_tips(|path, element| {
                        key_of(&ModelItem::Sink(parameter, path.clone(), element.clone()))
                    });
                    for (key, piece) in pieces {
                        grouped.entry(key).or_default().set(parameter, piece);
                    }
                }
                grouped
                    .into_iter()
                    .map(|(key, sinks)| {
                        let mut piece = self.clone();
                        piece.update(ModelValue::Sinks(sinks));
                        (key, piece)
                    })
                    .collect()
            }
            ModelSlot::Tito => {
                let mut grouped: BTreeMap<K, ParamMap<TitoTree>> = BTreeMap::new();
                for (parameter, tree) in self.tito.iter() {
                    let pieces = tree.partition_tips(|path, breadcrumbs| {
                        key_of(&ModelItem::Tito(parameter, path.clone(), breadcrumbs.clone()))
                    });
                    for (key, piece) in pieces {
                        grouped.entry(key).or_default().set(parameter, piece);
                    }
                }
                grouped
                    .into_iter()
                    .map(|(key, tito)| {
                        let mut piece = self.clone();
                        piece.update(ModelValue::Tito(tito));
                        (key, piece)
                    })
                    .collect()
            }
            ModelSlot::Modes => self
                .modes
                .partition_elements(|mode| key_of(&ModelItem::Mode(*mode)))
                .into_iter()
                .map(|(key, modes)| {
                    let mut piece = self.clone();
                    piece.update(ModelValue::Modes(modes));
                    (key, piece)
                })
                .collect(),
        }
    }
}

impl AbstractDomain for Model {
    fn bottom() -> Self {
        Self::default()
    }

    fn is_bottom(&self) -> bool {
        self.sources.is_bottom()
            && self.sinks.is_bottom()
            && self.tito.is_bottom()
            && self.modes.is_bottom()
    }

    fn join_with(&mut self, other: &Self) {
        self.sources.join_with(&other.sources);
        self.sinks.join_with(&other.sinks);
        self.tito.join_with(&other.tito);
        self.modes.join_with(&other.modes);
    }

    fn widen_with(&mut self, other: &Self, ctx: &WideningContext<'_>) {
        self.sources.widen_with(&other.sources, ctx);
        self.sinks.widen_with(&other.sinks, ctx);
        self.tito.widen_with(&other.tito, ctx);
        self.modes.widen_with(&other.modes, ctx);
    }

    fn less_or_equal(&self, other: &Self) -> bool {
        self.sources.less_or_equal(&other.sources)
            && self.sinks.less_or_equal(&other.sinks)
            && self.tito.less_or_equal(&other.tito)
            && self.modes.less_or_equal(&other.modes)
    }

    fn subtract(&mut self, to_remove: &Self) {
        self.sources.subtract(&to_remove.sources);
        self.sinks.subtract(&to_remove.sinks);
        self.tito.subtract(&to_remove.tito);
        self.modes.subtract(&to_remove.modes);
    }

    fn introspect(&self) -> DomainSketch {
        DomainSketch::node(
            "model",
            vec![
                DomainSketch::node("sources", vec![self.sources.introspect()]),
                DomainSketch::node("sinks", vec![self.sinks.introspect()]),
                DomainSketch::node("tito", vec![self.tito.introspect()]),
                DomainSketch::node("modes", vec![self.modes.introspect()]),
            ],
        )
    }
}

impl ProductDomain for Model {
    type Slot = ModelSlot;

    fn slot_is_bottom(&self, slot: ModelSlot) -> bool {
        match slot {
            ModelSlot::Sources => self.sources.is_bottom(),
            ModelSlot::Sinks => self.sinks.is_bottom(),
            ModelSlot::Tito => self.tito.is_bottom(),
            ModelSlot::Modes => self.modes.is_bottom(),
        }
    }
}
