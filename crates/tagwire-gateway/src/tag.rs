//! Tags: application-chosen keys that group elements for targeted updates.
//!
//! A [`TagValue`] is what callers pass in; it may be a single [`Tag`], a list,
//! or a [`TagProvider`] that yields more tags. [`expand_tags`] flattens it into
//! the concrete tags stored in the registry.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tagwire_core::{Result, TagwireError};
use tracing::error;

use crate::connection::Connection;

/// Expansion gives up past this nesting depth.
pub const MAX_TAG_DEPTH: usize = 10;
/// Expansion gives up once it has produced more than this many tags.
pub const MAX_TAGS: usize = 100;

/// A comparable, hashable registry key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    /// A named tag, e.g. `Tag::name("cart")`.
    Name(Cow<'static, str>),
    /// The identity of a shared object; two tags are equal iff they point at
    /// the same allocation.
    Ptr(PtrKey),
    /// Any other hashable value.
    Key(AnyKey),
}

impl Tag {
    pub fn name(name: impl Into<Cow<'static, str>>) -> Tag {
        Tag::Name(name.into())
    }

    /// Tag identifying the object behind `obj`.
    pub fn of<T: ?Sized>(obj: &Arc<T>) -> Tag {
        Tag::Ptr(PtrKey {
            addr: Arc::as_ptr(obj) as *const () as usize,
            type_name: std::any::type_name::<T>(),
        })
    }

    /// Tag from an arbitrary hashable value. Values of different types never
    /// compare equal.
    pub fn key<T>(value: T) -> Tag
    where
        T: Hash + Eq + fmt::Debug + Send + Sync + 'static,
    {
        Tag::Key(AnyKey(Arc::new(value)))
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Name(name) => write!(f, "Tag({name:?})"),
            Tag::Ptr(ptr) => write!(f, "{}({:#x})", ptr.type_name, ptr.addr),
            Tag::Key(key) => fmt::Debug::fmt(&key.0, f),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pointer identity. Only the address takes part in equality.
#[derive(Clone, Copy)]
pub struct PtrKey {
    addr: usize,
    type_name: &'static str,
}

impl PartialEq for PtrKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for PtrKey {}

impl Hash for PtrKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

/// Type-erased hashable tag value.
#[derive(Clone)]
pub struct AnyKey(Arc<dyn DynKey>);

trait DynKey: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynKey) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T> DynKey for T
where
    T: Hash + Eq + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynKey) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        std::any::TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

impl PartialEq for AnyKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for AnyKey {}

impl Hash for AnyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

/// Something that can stand in for one or more tags.
///
/// Providers are consulted during expansion with the connection doing the
/// expanding, if any. A provider that returns itself is used as a pointer tag.
pub trait TagProvider: Send + Sync + 'static {
    fn provide_tag(&self, conn: Option<&Connection>) -> TagValue;
}

/// Input to tag expansion.
#[derive(Clone, Default)]
pub enum TagValue {
    #[default]
    None,
    Tag(Tag),
    List(Vec<TagValue>),
    Provider(Arc<dyn TagProvider>),
    /// Plain text is rejected so it cannot be confused with an HTML id.
    Text(String),
    Int(i64),
    Bool(bool),
    /// Not comparable.
    Float(f64),
    /// Not comparable.
    Map(serde_json::Map<String, serde_json::Value>),
}

impl From<Tag> for TagValue {
    fn from(tag: Tag) -> Self {
        TagValue::Tag(tag)
    }
}

impl From<Vec<Tag>> for TagValue {
    fn from(tags: Vec<Tag>) -> Self {
        TagValue::List(tags.into_iter().map(TagValue::Tag).collect())
    }
}

impl From<Vec<TagValue>> for TagValue {
    fn from(values: Vec<TagValue>) -> Self {
        TagValue::List(values)
    }
}

impl From<Arc<dyn TagProvider>> for TagValue {
    fn from(provider: Arc<dyn TagProvider>) -> Self {
        TagValue::Provider(provider)
    }
}

impl From<serde_json::Value> for TagValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => TagValue::None,
            Value::Bool(b) => TagValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => TagValue::Int(i),
                None => TagValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => TagValue::Text(s),
            Value::Array(items) => TagValue::List(items.into_iter().map(TagValue::from).collect()),
            Value::Object(map) => TagValue::Map(map),
        }
    }
}

impl fmt::Debug for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::None => f.write_str("None"),
            TagValue::Tag(tag) => fmt::Debug::fmt(tag, f),
            TagValue::List(items) => f.debug_list().entries(items).finish(),
            TagValue::Provider(p) => write!(f, "Provider({:p})", Arc::as_ptr(p)),
            TagValue::Text(s) => write!(f, "Text({s:?})"),
            TagValue::Int(i) => write!(f, "Int({i})"),
            TagValue::Bool(b) => write!(f, "Bool({b})"),
            TagValue::Float(x) => write!(f, "Float({x})"),
            TagValue::Map(m) => write!(f, "Map({} keys)", m.len()),
        }
    }
}

fn same_provider(a: &Arc<dyn TagProvider>, b: &Arc<dyn TagProvider>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Flatten `value` into concrete tags, in order.
///
/// Lists and providers nest at most [`MAX_TAG_DEPTH`] levels and the result
/// holds at most [`MAX_TAGS`] tags; both limits yield
/// [`TagwireError::TooManyTags`], which is how provider cycles surface.
pub fn expand_tags(conn: Option<&Connection>, value: &TagValue) -> Result<Vec<Tag>> {
    let mut result = Vec::new();
    let mut stack = vec![(0usize, value.clone())];
    while let Some((depth, value)) = stack.pop() {
        if depth > MAX_TAG_DEPTH || result.len() > MAX_TAGS {
            return Err(TagwireError::TooManyTags);
        }
        match value {
            TagValue::None => {}
            TagValue::Tag(tag) => result.push(tag),
            TagValue::List(items) => {
                stack.extend(items.into_iter().rev().map(|item| (depth + 1, item)));
            }
            TagValue::Provider(provider) => match provider.provide_tag(conn) {
                TagValue::Provider(next) if same_provider(&provider, &next) => {
                    result.push(Tag::of(&provider));
                }
                next => stack.push((depth + 1, next)),
            },
            TagValue::Text(_) => return Err(TagwireError::IllegalTagType { type_name: "String" }),
            TagValue::Int(_) => return Err(TagwireError::IllegalTagType { type_name: "i64" }),
            TagValue::Bool(_) => return Err(TagwireError::IllegalTagType { type_name: "bool" }),
            TagValue::Float(_) => return Err(TagwireError::NotComparable { type_name: "f64" }),
            TagValue::Map(_) => return Err(TagwireError::NotComparable { type_name: "map" }),
        }
    }
    if result.len() > MAX_TAGS {
        return Err(TagwireError::TooManyTags);
    }
    Ok(result)
}

/// Like [`expand_tags`], but logs the error and returns no tags.
pub fn must_expand_tags(conn: Option<&Connection>, value: &TagValue) -> Vec<Tag> {
    match expand_tags(conn, value) {
        Ok(tags) => tags,
        Err(err) => {
            error!(error = %err, value = ?value, "tag expansion failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    struct Cart;

    impl TagProvider for Cart {
        fn provide_tag(&self, _conn: Option<&Connection>) -> TagValue {
            Tag::name("cart").into()
        }
    }

    /// Returns itself, so it becomes its own pointer tag.
    struct SelfTag(Weak<SelfTag>);

    impl TagProvider for SelfTag {
        fn provide_tag(&self, _conn: Option<&Connection>) -> TagValue {
            match self.0.upgrade() {
                Some(me) => TagValue::Provider(me),
                None => TagValue::None,
            }
        }
    }

    /// Always points at its partner, forming a cycle.
    struct Loop(parking_lot::Mutex<Option<Arc<dyn TagProvider>>>);

    impl TagProvider for Loop {
        fn provide_tag(&self, _conn: Option<&Connection>) -> TagValue {
            match self.0.lock().clone() {
                Some(next) => TagValue::Provider(next),
                None => TagValue::None,
            }
        }
    }

    #[test]
    fn test_expand_single_and_list() {
        let tags = expand_tags(None, &Tag::name("a").into()).unwrap();
        assert_eq!(tags, vec![Tag::name("a")]);

        let value: TagValue = vec![Tag::name("a"), Tag::key(7u32), Tag::name("b")].into();
        let tags = expand_tags(None, &value).unwrap();
        assert_eq!(tags, vec![Tag::name("a"), Tag::key(7u32), Tag::name("b")]);
    }

    #[test]
    fn test_expand_none_is_empty() {
        assert!(expand_tags(None, &TagValue::None).unwrap().is_empty());
    }

    #[test]
    fn test_provider_is_followed() {
        let cart: Arc<dyn TagProvider> = Arc::new(Cart);
        let tags = expand_tags(None, &TagValue::List(vec![cart.into()])).unwrap();
        assert_eq!(tags, vec![Tag::name("cart")]);
    }

    #[test]
    fn test_self_returning_provider_is_pointer_tag() {
        let me = Arc::new_cyclic(|weak| SelfTag(weak.clone()));
        let provider: Arc<dyn TagProvider> = me.clone();
        let tags = expand_tags(None, &provider.into()).unwrap();
        assert_eq!(tags, vec![Tag::of(&me)]);
    }

    #[test]
    fn test_provider_cycle_is_too_many_tags() {
        let a = Arc::new(Loop(parking_lot::Mutex::new(None)));
        let b = Arc::new(Loop(parking_lot::Mutex::new(Some(a.clone()))));
        *a.0.lock() = Some(b.clone());
        let err = expand_tags(None, &TagValue::Provider(a.clone())).unwrap_err();
        assert!(matches!(err, TagwireError::TooManyTags));
        // break the cycle so the test doesn't leak
        *a.0.lock() = None;
    }

    #[test]
    fn test_deep_nesting_is_too_many_tags() {
        let mut value = TagValue::Tag(Tag::name("deep"));
        for _ in 0..=MAX_TAG_DEPTH {
            value = TagValue::List(vec![value]);
        }
        assert!(matches!(expand_tags(None, &value), Err(TagwireError::TooManyTags)));
    }

    #[test]
    fn test_result_size_limit() {
        let ok: TagValue = (0..MAX_TAGS as u64).map(Tag::key).collect::<Vec<_>>().into();
        assert_eq!(expand_tags(None, &ok).unwrap().len(), MAX_TAGS);

        let too_many: TagValue = (0..150u64).map(Tag::key).collect::<Vec<_>>().into();
        assert!(matches!(expand_tags(None, &too_many), Err(TagwireError::TooManyTags)));
    }

    #[test]
    fn test_illegal_and_incomparable_values() {
        let err = expand_tags(None, &TagValue::Text("a".into())).unwrap_err();
        assert!(matches!(err, TagwireError::IllegalTagType { type_name: "String" }));
        let err = expand_tags(None, &TagValue::Int(1)).unwrap_err();
        assert!(matches!(err, TagwireError::IllegalTagType { .. }));
        let err = expand_tags(None, &serde_json::json!({"a": 1}).into()).unwrap_err();
        assert!(matches!(err, TagwireError::NotComparable { type_name: "map" }));
        let err = expand_tags(None, &serde_json::json!([1.5]).into()).unwrap_err();
        assert!(matches!(err, TagwireError::NotComparable { type_name: "f64" }));
    }

    #[test]
    fn test_must_expand_swallows_errors() {
        assert!(must_expand_tags(None, &TagValue::Bool(true)).is_empty());
    }

    #[test]
    fn test_tag_equality() {
        assert_eq!(Tag::name("x"), Tag::name(String::from("x")));
        assert_ne!(Tag::key(1u32), Tag::key(1u64));
        assert_ne!(Tag::key("x"), Tag::name("x"));

        let obj = Arc::new(Cart);
        let erased: Arc<dyn TagProvider> = obj.clone();
        assert_eq!(Tag::of(&obj), Tag::of(&erased));
        assert_ne!(Tag::of(&obj), Tag::of(&Arc::new(Cart)));
    }
}
