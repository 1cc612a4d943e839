//! Product Domain support: typed slots, part routing, strictness
//!
//! A product composes heterogeneous sub-domains into one fixed-size struct
//! with one typed field per slot. Compositions declare two closed enums:
//! a `SlotKey` (one variant per field, with a `strict` flag) and a
//! `PartKey` (every structural part any sub-domain exposes). A
//! `RouteTable`, built once per composition, maps each part to its owning
//! slot so generic traversal dispatches without exposing the layout.
//!
//! Routing mistakes are programming errors, not data errors: building a
//! table with a duplicate or missing route panics, as does looking up a
//! part whose index is out of range. Values crossing the generic boundary
//! are tagged unions with one variant per slot — never type-erased.
//!
//! A `strict` slot collapses the whole product to bottom the instant that
//! slot's value is bottom; `enforce_strictness` is re-run after every
//! slot update.

use crate::core::AbstractDomain;
use std::fmt::Debug;
use std::marker::PhantomData;

/// Closed enum of a product's slots.
pub trait SlotKey: Copy + Eq + Debug + 'static {
    const ALL: &'static [Self];

    /// Position of this slot in the product struct.
    fn index(self) -> usize;

    fn name(self) -> &'static str;

    /// Strict slots bottom the whole product when they empty.
    fn is_strict(self) -> bool;
}

/// Closed enum of the structural parts a composition exposes.
pub trait PartKey: Copy + Eq + Debug + 'static {
    const ALL: &'static [Self];

    fn index(self) -> usize;

    fn name(self) -> &'static str;
}

/// Part → owning-slot table, built once at composition definition.
#[derive(Debug)]
pub struct RouteTable<P: PartKey, S: SlotKey> {
    routes: Vec<S>,
    _parts: PhantomData<fn(P)>,
}

impl<P: PartKey, S: SlotKey> RouteTable<P, S> {
    pub fn builder() -> RouteTableBuilder<P, S> {
        RouteTableBuilder {
            routes: vec![None; P::ALL.len()],
            _parts: PhantomData,
        }
    }

    /// The slot owning `part`.
    pub fn slot_for(&self, part: P) -> S {
        self.routes[part.index()]
    }
}

/// Builder enforcing a total, duplicate-free routing.
pub struct RouteTableBuilder<P: PartKey, S: SlotKey> {
    routes: Vec<Option<S>>,
    _parts: PhantomData<fn(P)>,
}

impl<P: PartKey, S: SlotKey> RouteTableBuilder<P, S> {
    /// Register `part` as owned by `slot`.
    ///
    /// # Panics
    ///
    /// If `part` was already routed — two sub-domains may not claim the
    /// same part.
    pub fn route(mut self, part: P, slot: S) -> Self {
        let index = part.index();
        assert!(
            index < self.routes.len(),
            "part {:?} has index {} outside the declared part list",
            part,
            index
        );
        if let Some(previous) = self.routes[index] {
            panic!(
                "part {:?} already routed to slot {}; cannot also route to {}",
                part,
                previous.name(),
                slot.name()
            );
        }
        self.routes[index] = Some(slot);
        self
    }

    /// Finish the table.
    ///
    /// # Panics
    ///
    /// If any declared part was left unrouted.
    pub fn build(self) -> RouteTable<P, S> {
        let mut routes = Vec::with_capacity(self.routes.len());
        for (index, slot) in self.routes.into_iter().enumerate() {
            match slot {
                Some(slot) => routes.push(slot),
                None => panic!("part {:?} has no owning slot", P::ALL[index]),
            }
        }
        RouteTable {
            routes,
            _parts: PhantomData,
        }
    }
}

/// Extra surface shared by product compositions.
pub trait ProductDomain: AbstractDomain {
    type Slot: SlotKey;

    fn slot_is_bottom(&self, slot: Self::Slot) -> bool;

    /// Collapse to global bottom if any strict slot has emptied. Products
    /// call this after join/widen/subtract and after every slot update.
    fn enforce_strictness(&mut self) {
        if self.is_bottom() {
            return;
        }
        let collapsed = Self::Slot::ALL
            .iter()
            .any(|slot| slot.is_strict() && self.slot_is_bottom(*slot));
        if collapsed {
            *self = Self::bottom();
        }
    }
}
