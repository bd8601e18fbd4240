//! Model traits: state slices keyed by a type tag instead of runtime type
//! reflection.
//!
//! An application describes its state as one enum implementing [`Model`].
//! Each enum variant wraps a concrete state type; that type implements
//! [`Variant`] so handlers can read and write it without matching on the
//! enum by hand.

use std::fmt::Debug;
use std::hash::Hash;

/// The state held by an engine: a closed set of variants, one live value
/// per [`Kind`](Model::Kind).
///
/// # Contract
///
/// - `kind` must be a pure function of the variant, never of the payload.
///   Two values with the same kind replace each other in the store.
pub trait Model: Clone + Send + Sync + 'static {
    /// Tag identifying which slice of state a value belongs to.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// The tag of this value.
    fn kind(&self) -> Self::Kind;
}

/// A concrete state type that is one variant of model `M`.
///
/// # Examples
///
/// ```
/// use empress::{Model, Variant};
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Count(u32);
///
/// #[derive(Debug, Clone, PartialEq)]
/// enum AppModel {
///     Count(Count),
/// }
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum AppKind {
///     Count,
/// }
///
/// impl Model for AppModel {
///     type Kind = AppKind;
///     fn kind(&self) -> AppKind {
///         match self {
///             AppModel::Count(_) => AppKind::Count,
///         }
///     }
/// }
///
/// impl From<Count> for AppModel {
///     fn from(value: Count) -> Self {
///         AppModel::Count(value)
///     }
/// }
///
/// impl Variant<AppModel> for Count {
///     const KIND: AppKind = AppKind::Count;
///     fn from_model(model: AppModel) -> Option<Self> {
///         match model {
///             AppModel::Count(c) => Some(c),
///         }
///     }
/// }
///
/// let model: AppModel = Count(3).into();
/// assert_eq!(model.kind(), Count::KIND);
/// assert_eq!(Count::from_model(model), Some(Count(3)));
/// ```
pub trait Variant<M: Model>: Sized + Into<M> {
    /// The kind every value of this type maps to.
    const KIND: M::Kind;

    /// Project a model back into this type; `None` if it is another variant.
    fn from_model(model: M) -> Option<Self>;
}
