//! Predicate combinators and derived-column builders.
//!
//! A [`RowPredicate`] accumulates a chain of extension descriptors (oldest
//! first) together with its current value expression. Each combinator appends
//! one descriptor: a slot type, an updater that recomputes the slot of the
//! local row from the whole table, and a getter that reads the slot back out
//! of any row. Naming a builder binds its head slot to a variant of the
//! user's name enumeration so other predicates can call it by symbol.
//!
//! Chains matter because derived columns depend on earlier derived columns:
//! an updater may read the slots produced by every descriptor before it in
//! the same chain, freshly updated within the same engine pass.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::SstError;
use crate::row::{Row, Scalar, SlotType, SlotValue};

/// Value expression of a builder: a function of one row plus the chain's
/// extension slots.
pub(crate) type ValueFn<R, V> = Arc<dyn Fn(&R, ExtensionsRef<'_>) -> V + Send + Sync>;

/// Recomputes one extension slot of the local row from the whole table. The
/// second argument is the chain's base slot index within the table layout.
pub(crate) type UpdaterFn<R> = Arc<dyn Fn(&TableView<R>, usize) -> SlotValue + Send + Sync>;

/// Reads a derived value out of a row given the chain's base slot index.
pub(crate) type GetterFn<R> = Arc<dyn Fn(&R, &[SlotValue], usize) -> SlotValue + Send + Sync>;

/// A getter with its chain base already bound.
pub(crate) type BoundGetterFn<R> = Arc<dyn Fn(&R, &[SlotValue]) -> SlotValue + Send + Sync>;

/// Names for derived columns and named row functions.
///
/// Implementors are expected to be field-less enums whose `index` is dense
/// starting at zero; the table enforces density at construction.
pub trait NameEnum: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    fn index(self) -> usize;
}

/// A value-level copy of the table an updater pass evaluates against: user
/// rows plus decoded extension slots, materialized once per pass.
pub struct TableView<R> {
    rows: Vec<R>,
    slots: Vec<Vec<SlotValue>>,
    local: usize,
}

impl<R: Row> TableView<R> {
    pub(crate) fn new(rows: Vec<R>, slots: Vec<Vec<SlotValue>>, local: usize) -> TableView<R> {
        TableView { rows, slots, local }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn user_row(&self, index: usize) -> &R {
        &self.rows[index]
    }

    pub fn slots(&self, index: usize) -> &[SlotValue] {
        &self.slots[index]
    }

    pub fn local_index(&self) -> usize {
        self.local
    }

    /// Reflect a freshly written local slot so later updaters in the same
    /// pass observe it.
    pub(crate) fn set_local_slot(&mut self, slot: usize, value: SlotValue) {
        self.slots[self.local][slot] = value;
    }
}

/// Read access to one chain's slots within a row.
#[derive(Clone, Copy)]
pub struct ExtensionsRef<'a> {
    slots: &'a [SlotValue],
    base: usize,
}

impl<'a> ExtensionsRef<'a> {
    pub(crate) fn new(slots: &'a [SlotValue], base: usize) -> ExtensionsRef<'a> {
        ExtensionsRef { slots, base }
    }

    /// Slot `index` of the chain (0 = oldest descriptor).
    pub fn get(&self, index: usize) -> SlotValue {
        self.slots[self.base + index]
    }
}

/// One derived-column descriptor in a builder chain.
pub(crate) struct ColumnDescriptor<R: Row> {
    pub(crate) slot_type: SlotType,
    /// Uniqueness tag; `None` until the chain is named.
    pub(crate) tag: Option<usize>,
    /// Whether this slot is bound to a name in the registry.
    pub(crate) named: bool,
    pub(crate) name_type: Option<TypeId>,
    pub(crate) updater: UpdaterFn<R>,
    pub(crate) getter: GetterFn<R>,
}

/// A predicate builder over rows of type `R` with current value type `V`.
pub struct RowPredicate<R: Row, V: Scalar> {
    chain: Vec<ColumnDescriptor<R>>,
    value: ValueFn<R, V>,
}

fn slot_getter<R: Row>(index: usize) -> GetterFn<R> {
    Arc::new(move |_row: &R, slots: &[SlotValue], base: usize| slots[base + index])
}

/// Lift a pure function of the row into a builder.
///
/// The new slot holds the function's value for the owning node's row, so
/// remote nodes can read each node's own evaluation; the builder's current
/// value still evaluates the function directly on whichever row it is given.
pub fn as_row_pred<R, V, F>(f: F) -> RowPredicate<R, V>
where
    R: Row,
    V: Scalar,
    F: Fn(&R) -> V + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let updater: UpdaterFn<R> = {
        let f = f.clone();
        Arc::new(move |view: &TableView<R>, _base: usize| {
            f(view.user_row(view.local_index())).into_slot()
        })
    };
    let value: ValueFn<R, V> = Arc::new(move |row: &R, _ext: ExtensionsRef<'_>| f(row));
    RowPredicate {
        chain: vec![ColumnDescriptor {
            slot_type: V::SLOT_TYPE,
            tag: None,
            named: false,
            name_type: None,
            updater,
            getter: slot_getter(0),
        }],
        value,
    }
}

/// Universal quantifier over the table (the `E` of the detection calculus):
/// the new bool slot holds "the predicate's current value is true on every
/// row".
pub fn e<R: Row>(pb: RowPredicate<R, bool>) -> RowPredicate<R, bool> {
    let RowPredicate { mut chain, value } = pb;
    let index = chain.len();
    let updater: UpdaterFn<R> = {
        let value = value.clone();
        Arc::new(move |view: &TableView<R>, base: usize| {
            let mut holds = true;
            for i in 0..view.num_rows() {
                if !value(view.user_row(i), ExtensionsRef::new(view.slots(i), base)) {
                    holds = false;
                }
            }
            SlotValue::Bool(holds)
        })
    };
    chain.push(ColumnDescriptor {
        slot_type: SlotType::Bool,
        tag: None,
        named: false,
        name_type: None,
        updater,
        getter: slot_getter(index),
    });
    RowPredicate {
        chain,
        value: Arc::new(move |_row: &R, ext: ExtensionsRef<'_>| bool::from_slot(ext.get(index))),
    }
}

/// Minimum of the predicate's current value over all rows. Ties keep the
/// first row's value.
pub fn min_of<R: Row, V: Scalar>(pb: RowPredicate<R, V>) -> RowPredicate<R, V> {
    let RowPredicate { mut chain, value } = pb;
    let index = chain.len();
    let updater: UpdaterFn<R> = {
        let value = value.clone();
        Arc::new(move |view: &TableView<R>, base: usize| {
            let mut best: Option<V> = None;
            for i in 0..view.num_rows() {
                let v = value(view.user_row(i), ExtensionsRef::new(view.slots(i), base));
                best = match best {
                    None => Some(v),
                    Some(b) if v < b => Some(v),
                    Some(b) => Some(b),
                };
            }
            best.expect("a group always has at least one row").into_slot()
        })
    };
    chain.push(ColumnDescriptor {
        slot_type: V::SLOT_TYPE,
        tag: None,
        named: false,
        name_type: None,
        updater,
        getter: slot_getter(index),
    });
    RowPredicate {
        chain,
        value: Arc::new(move |_row: &R, ext: ExtensionsRef<'_>| V::from_slot(ext.get(index))),
    }
}

/// Bind the builder's head slot to `name`.
///
/// If nothing in the chain is named yet, every nameless ancestor also
/// receives `name`'s index as its uniqueness tag; otherwise only the head is
/// tagged. Along one chain, names must be attached in increasing index
/// order.
pub fn named<R: Row, V: Scalar, N: NameEnum>(name: N, pb: RowPredicate<R, V>) -> RowPredicate<R, V> {
    let RowPredicate { mut chain, value } = pb;
    let tag = name.index();
    if !chain.iter().any(|d| d.named) {
        // The source's change_uniqueness: stamp the whole anonymous prefix.
        for desc in chain.iter_mut() {
            if desc.tag.is_none() {
                desc.tag = Some(tag);
            }
        }
    }
    let head = chain.last_mut().expect("builder chains are never empty");
    head.tag = Some(tag);
    head.named = true;
    head.name_type = Some(TypeId::of::<N>());
    RowPredicate { chain, value }
}

pub(crate) struct NamedGetter<R: Row> {
    pub(crate) slot_type: SlotType,
    pub(crate) read: BoundGetterFn<R>,
}

/// Ordered collection of derived columns and named row functions for one
/// table, validated by [`ColumnSet::finish`].
pub struct ColumnSet<R: Row, N: NameEnum> {
    chains: Vec<Vec<ColumnDescriptor<R>>>,
    functions: Vec<(usize, NamedGetter<R>)>,
    _name: PhantomData<N>,
}

impl<R: Row, N: NameEnum> Default for ColumnSet<R, N> {
    fn default() -> Self {
        ColumnSet::new()
    }
}

impl<R: Row, N: NameEnum> ColumnSet<R, N> {
    pub fn new() -> ColumnSet<R, N> {
        ColumnSet {
            chains: Vec::new(),
            functions: Vec::new(),
            _name: PhantomData,
        }
    }

    /// Register a derived-column builder. Registration order fixes slot
    /// order in the internal row.
    pub fn column<V: Scalar>(mut self, pb: RowPredicate<R, V>) -> ColumnSet<R, N> {
        self.chains.push(pb.chain);
        self
    }

    /// Register a named row function: no slot, evaluated on demand against
    /// whichever row it is called with.
    pub fn function<V, F>(mut self, name: N, f: F) -> ColumnSet<R, N>
    where
        V: Scalar,
        F: Fn(&R) -> V + Send + Sync + 'static,
    {
        self.functions.push((
            name.index(),
            NamedGetter {
                slot_type: V::SLOT_TYPE,
                read: Arc::new(move |row: &R, _slots: &[SlotValue]| f(row).into_slot()),
            },
        ));
        self
    }

    /// Validate and freeze the registry.
    pub fn finish(self) -> Result<DerivedColumns<R>, SstError> {
        let expected = TypeId::of::<N>();
        let mut descriptors: Vec<ColumnDescriptor<R>> = Vec::new();
        let mut bases: Vec<usize> = Vec::new();
        let mut named_entries: Vec<(usize, NamedGetter<R>)> = Vec::new();

        for chain in self.chains {
            let base = descriptors.len();
            let mut last_named: Option<usize> = None;
            for desc in &chain {
                let Some(tag) = desc.tag else {
                    return Err(SstError::Config(
                        "derived column chain contains a nameless extension; \
                         name the builder before registering it"
                            .into(),
                    ));
                };
                if desc.named {
                    if desc.name_type != Some(expected) {
                        return Err(SstError::Config(
                            "derived column was named from a different enumeration".into(),
                        ));
                    }
                    if last_named.is_some_and(|prev| tag <= prev) {
                        return Err(SstError::Config(
                            "names along one builder chain must increase".into(),
                        ));
                    }
                    last_named = Some(tag);
                }
            }
            for desc in chain {
                if desc.named {
                    let getter = desc.getter.clone();
                    named_entries.push((
                        desc.tag.expect("validated above"),
                        NamedGetter {
                            slot_type: desc.slot_type,
                            read: Arc::new(move |row: &R, slots: &[SlotValue]| {
                                getter(row, slots, base)
                            }),
                        },
                    ));
                }
                bases.push(base);
                descriptors.push(desc);
            }
        }
        named_entries.extend(self.functions);
        // Density is a property of the combined tag set; whether a tag came
        // from a column chain or a row function does not matter.
        named_entries.sort_by_key(|(tag, _)| *tag);

        let mut named = HashMap::new();
        let name_type = if named_entries.is_empty() {
            None
        } else {
            Some(expected)
        };
        for (position, (tag, getter)) in named_entries.into_iter().enumerate() {
            if tag != position {
                return Err(SstError::Config(format!(
                    "names must be dense, consecutive integers starting at 0: \
                     expected tag {position}, found {tag}"
                )));
            }
            named.insert(tag, getter);
        }

        let slot_types = descriptors.iter().map(|d| d.slot_type).collect();
        Ok(DerivedColumns {
            descriptors,
            bases,
            slot_types,
            named,
            name_type,
        })
    }
}

/// The frozen registry a table is built from: flattened descriptors with
/// their chain bases, plus the name-to-getter map.
pub struct DerivedColumns<R: Row> {
    pub(crate) descriptors: Vec<ColumnDescriptor<R>>,
    pub(crate) bases: Vec<usize>,
    pub(crate) slot_types: Vec<SlotType>,
    named: HashMap<usize, NamedGetter<R>>,
    name_type: Option<TypeId>,
}

impl<R: Row> DerivedColumns<R> {
    pub fn num_slots(&self) -> usize {
        self.descriptors.len()
    }

    /// Apply the getter registered under `name` to a row.
    ///
    /// Panics when `name` comes from a different enumeration than the one
    /// the table was built with, when no such name was registered, or when
    /// `V` does not match the registered value type. All three are
    /// programmer errors.
    pub(crate) fn call<V: Scalar, N: NameEnum>(&self, name: N, row: &R, slots: &[SlotValue]) -> V {
        match self.name_type {
            Some(ty) if ty == TypeId::of::<N>() => {}
            Some(_) => panic!("{name:?} comes from a different enumeration than this table's names"),
            None => panic!("this table has no named columns or functions"),
        }
        let getter = self
            .named
            .get(&name.index())
            .unwrap_or_else(|| panic!("nothing is registered under {name:?}"));
        assert!(
            getter.slot_type == V::SLOT_TYPE,
            "{name:?} yields {:?}, not {:?}",
            getter.slot_type,
            V::SLOT_TYPE
        );
        V::from_slot((getter.read)(row, slots))
    }
}
