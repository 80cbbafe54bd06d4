//! Type-erased call arguments and the cached-call registration surface
//!
//! Rust has no signature reflection, so a cached call carries its arguments
//! explicitly: [`CallArgs`] is an ordered list of named, type-erased values.
//! Registration ([`CachedOptions`]) declares how those arguments become a
//! cache key: which one is the entity id, which are adapted through custom
//! extractors, and which are ignored. The same [`CallArgs`] value is handed
//! to the user fallback, which reads typed values back out with
//! [`CallArgs::get`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::KeyConfig;
use crate::error::{GCacheError, GCacheResult};
use crate::key::{Codec, GCacheKey};

/// Adapter turning a raw argument into the string that lands in the cache
/// key. Adapters usually downcast to the concrete type and pick one field.
pub type ArgAdapter = Arc<dyn Fn(&ArgValue) -> anyhow::Result<String> + Send + Sync>;

trait ErasedArg: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn render(&self) -> Option<String>;
}

struct DisplayArg<T>(T);

impl<T: fmt::Display + Send + Sync + 'static> ErasedArg for DisplayArg<T> {
    fn as_any(&self) -> &dyn Any {
        &self.0
    }

    fn render(&self) -> Option<String> {
        Some(self.0.to_string())
    }
}

struct OpaqueArg<T>(T);

impl<T: Send + Sync + 'static> ErasedArg for OpaqueArg<T> {
    fn as_any(&self) -> &dyn Any {
        &self.0
    }

    fn render(&self) -> Option<String> {
        None
    }
}

/// One type-erased call argument. Cheap to clone.
#[derive(Clone)]
pub struct ArgValue(Arc<dyn ErasedArg>);

impl ArgValue {
    /// Wrap a value whose natural string form (`Display`) is its key form.
    pub fn new<T>(value: T) -> Self
    where
        T: fmt::Display + Send + Sync + 'static,
    {
        Self(Arc::new(DisplayArg(value)))
    }

    /// Wrap a value with no natural string form. Such an argument must be
    /// covered by an adapter (or the ignore list), otherwise key construction
    /// fails and the call degrades to the fallback.
    pub fn opaque<T>(value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self(Arc::new(OpaqueArg(value)))
    }

    /// Borrow the wrapped value as its concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }

    fn render(&self) -> Option<String> {
        self.0.render()
    }
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Some(rendered) => write!(f, "ArgValue({rendered})"),
            None => f.write_str("ArgValue(<opaque>)"),
        }
    }
}

/// Ordered, named arguments of one cached call.
#[derive(Clone, Default, Debug)]
pub struct CallArgs {
    args: Vec<(String, ArgValue)>,
}

impl CallArgs {
    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named argument.
    pub fn arg<T>(self, name: &str, value: T) -> Self
    where
        T: fmt::Display + Send + Sync + 'static,
    {
        self.arg_value(name, ArgValue::new(value))
    }

    /// Append a pre-wrapped argument (use for opaque values).
    pub fn arg_value(mut self, name: &str, value: ArgValue) -> Self {
        self.args.push((name.to_string(), value));
        self
    }

    /// Typed access for fallbacks. Fails with
    /// [`GCacheError::FuncArgMissing`] when no argument with this name and
    /// type exists in the call.
    pub fn get<T: 'static>(&self, name: &str) -> GCacheResult<&T> {
        self.value(name)
            .and_then(ArgValue::downcast_ref)
            .ok_or_else(|| GCacheError::FuncArgMissing(name.to_string()))
    }

    /// The raw argument value, if present.
    pub fn value(&self, name: &str) -> Option<&ArgValue> {
        self.args
            .iter()
            .find(|(arg_name, _)| arg_name == name)
            .map(|(_, value)| value)
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the call has no arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.args
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }
}

/// Declaration of the id argument: a plain name, or a name plus an extractor
/// applied to the bound value.
#[derive(Clone)]
pub enum IdArg {
    /// Use the named argument's string form as the entity id
    Name(String),
    /// Apply the extractor to the named argument to obtain the entity id
    Extracted(String, ArgAdapter),
}

impl IdArg {
    /// Id taken from the named argument directly.
    pub fn name(name: &str) -> Self {
        IdArg::Name(name.to_string())
    }

    /// Id produced by applying `extract` to the named argument.
    pub fn extracted<F>(name: &str, extract: F) -> Self
    where
        F: Fn(&ArgValue) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        IdArg::Extracted(name.to_string(), Arc::new(extract))
    }

    pub(crate) fn arg_name(&self) -> &str {
        match self {
            IdArg::Name(name) => name,
            IdArg::Extracted(name, _) => name,
        }
    }
}

impl fmt::Debug for IdArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdArg::Name(name) => f.debug_tuple("Name").field(name).finish(),
            IdArg::Extracted(name, _) => f.debug_tuple("Extracted").field(name).finish(),
        }
    }
}

/// Registration options for one cached use case.
#[derive(Clone)]
pub struct CachedOptions {
    pub(crate) use_case: String,
    pub(crate) key_type: String,
    pub(crate) id_arg: IdArg,
    pub(crate) arg_adapters: HashMap<String, ArgAdapter>,
    pub(crate) ignore_args: Vec<String>,
    pub(crate) track_for_invalidation: bool,
    pub(crate) default_config: Option<KeyConfig>,
    pub(crate) codec: Option<Arc<dyn Codec>>,
}

impl CachedOptions {
    /// Options for `use_case`, keyed by `key_type` entities identified by
    /// `id_arg`.
    pub fn new(use_case: &str, key_type: &str, id_arg: IdArg) -> Self {
        Self {
            use_case: use_case.to_string(),
            key_type: key_type.to_string(),
            id_arg,
            arg_adapters: HashMap::new(),
            ignore_args: Vec::new(),
            track_for_invalidation: false,
            default_config: None,
            codec: None,
        }
    }

    /// Register an adapter for the named argument. An adapter on the id
    /// argument keeps it in the key's argument list in adapted form.
    pub fn arg_adapter<F>(mut self, name: &str, adapter: F) -> Self
    where
        F: Fn(&ArgValue) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.arg_adapters.insert(name.to_string(), Arc::new(adapter));
        self
    }

    /// Exclude the named arguments from the cache key.
    pub fn ignore_args(mut self, names: &[&str]) -> Self {
        self.ignore_args = names.iter().map(|name| name.to_string()).collect();
        self
    }

    /// Track writes for watermark-based invalidation.
    pub fn track_for_invalidation(mut self, track: bool) -> Self {
        self.track_for_invalidation = track;
        self
    }

    /// Config used when the provider returns nothing for this use case.
    pub fn default_config(mut self, config: KeyConfig) -> Self {
        self.default_config = Some(config);
        self
    }

    /// Attach a payload codec applied in the remote tier.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Reject names that would collide with the URN separators. Argument
    /// values are not checked; avoiding separators there is the caller's
    /// contract.
    pub(crate) fn validate(&self) -> GCacheResult<()> {
        if self.key_type.chars().any(|c| ":&?#{}".contains(c)) {
            return Err(GCacheError::KeyConstructionFailed(format!(
                "key type contains URN separator characters: {}",
                self.key_type
            )));
        }
        if self.use_case.chars().any(|c| "#{}".contains(c)) {
            return Err(GCacheError::KeyConstructionFailed(format!(
                "use case contains URN separator characters: {}",
                self.use_case
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for CachedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedOptions")
            .field("use_case", &self.use_case)
            .field("key_type", &self.key_type)
            .field("id_arg", &self.id_arg)
            .field("ignore_args", &self.ignore_args)
            .field("track_for_invalidation", &self.track_for_invalidation)
            .finish()
    }
}

/// Build the cache key for one call.
///
/// Rules, in order:
/// 1. The id argument must be bound; otherwise [`GCacheError::KeyArgMissing`].
/// 2. The id is the argument's string form, or the id extractor's output.
/// 3. Remaining arguments are dropped if ignored, and the id argument is
///    dropped unless an adapter keeps it in adapted form.
/// 4. Each kept argument is stringified through its adapter when one exists,
///    through `Display` otherwise; opaque values without an adapter fail.
/// 5. The key sorts arguments by name for canonicalization.
pub(crate) fn build_key(options: &CachedOptions, args: &CallArgs) -> GCacheResult<GCacheKey> {
    let id_name = options.id_arg.arg_name();
    let id_value = args
        .value(id_name)
        .ok_or_else(|| GCacheError::KeyArgMissing(id_name.to_string()))?;

    let id = match &options.id_arg {
        IdArg::Name(_) => id_value.render().ok_or_else(|| {
            GCacheError::KeyConstructionFailed(format!(
                "id argument {id_name} has no string form; use an id extractor"
            ))
        })?,
        IdArg::Extracted(_, extract) => extract(id_value)
            .map_err(|e| GCacheError::KeyConstructionFailed(e.to_string()))?,
    };

    let keep_id_in_args = options.arg_adapters.contains_key(id_name);

    let mut key_args = Vec::with_capacity(args.len());
    for (name, value) in args.iter() {
        if name == id_name && !keep_id_in_args {
            continue;
        }
        if options.ignore_args.iter().any(|ignored| ignored == name) {
            continue;
        }
        let rendered = match options.arg_adapters.get(name) {
            Some(adapter) => {
                adapter(value).map_err(|e| GCacheError::KeyConstructionFailed(e.to_string()))?
            }
            None => value.render().ok_or_else(|| {
                GCacheError::KeyConstructionFailed(format!(
                    "argument {name} has no string form and no adapter"
                ))
            })?,
        };
        key_args.push((name.to_string(), rendered));
    }

    let mut builder = GCacheKey::builder(&options.key_type, &id, &options.use_case)
        .args(key_args)
        .track_for_invalidation(options.track_for_invalidation);
    if let Some(config) = &options.default_config {
        builder = builder.default_config(config.clone());
    }
    if let Some(codec) = &options.codec {
        builder = builder.codec(codec.clone());
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Account {
        email: String,
    }

    #[test]
    fn test_call_args_typed_access() {
        let args = CallArgs::new().arg("x", 7u64).arg("name", "ada");
        assert_eq!(*args.get::<u64>("x").unwrap(), 7);
        assert_eq!(*args.get::<&str>("name").unwrap(), "ada");
        assert!(matches!(
            args.get::<u64>("missing"),
            Err(GCacheError::FuncArgMissing(_))
        ));
        // Wrong type reads as an argument that does not exist.
        assert!(matches!(
            args.get::<String>("x"),
            Err(GCacheError::FuncArgMissing(_))
        ));
    }

    #[test]
    fn test_build_key_omits_id_and_sorts() {
        let options = CachedOptions::new("users.load", "user_id", IdArg::name("user"));
        let args = CallArgs::new().arg("b", 2u32).arg("user", 42u64).arg("a", 1u32);
        let key = build_key(&options, &args).unwrap();
        assert_eq!(key.urn(), "urn:user_id:42?a=1&b=2#users.load");
    }

    #[test]
    fn test_build_key_missing_id_arg() {
        let options = CachedOptions::new("users.load", "user_id", IdArg::name("user"));
        let args = CallArgs::new().arg("a", 1u32);
        assert!(matches!(
            build_key(&options, &args),
            Err(GCacheError::KeyArgMissing(_))
        ));
    }

    #[test]
    fn test_build_key_id_extractor() {
        let options = CachedOptions::new(
            "accounts.load",
            "account_email",
            IdArg::extracted("account", |value| {
                let account = value
                    .downcast_ref::<Account>()
                    .ok_or_else(|| anyhow::anyhow!("expected an Account"))?;
                Ok(account.email.clone())
            }),
        );
        let account = Account {
            email: "ada@example.com".to_string(),
        };
        let args = CallArgs::new().arg_value("account", ArgValue::opaque(account));
        let key = build_key(&options, &args).unwrap();
        assert_eq!(key.id(), "ada@example.com");
        assert_eq!(key.urn(), "urn:account_email:ada@example.com#accounts.load");
    }

    #[test]
    fn test_build_key_keeps_adapted_id_in_args() {
        let options = CachedOptions::new("users.load", "user_id", IdArg::name("user"))
            .arg_adapter("user", |value| {
                Ok(format!("u{}", value.downcast_ref::<u64>().unwrap()))
            });
        let args = CallArgs::new().arg("user", 42u64);
        let key = build_key(&options, &args).unwrap();
        assert_eq!(key.urn(), "urn:user_id:42?user=u42#users.load");
    }

    #[test]
    fn test_build_key_ignore_args() {
        let options = CachedOptions::new("users.load", "user_id", IdArg::name("user"))
            .ignore_args(&["session"]);
        let args = CallArgs::new().arg("user", 1u64).arg("session", "abc");
        let key = build_key(&options, &args).unwrap();
        assert_eq!(key.urn(), "urn:user_id:1#users.load");
    }

    #[test]
    fn test_build_key_opaque_without_adapter_fails() {
        let options = CachedOptions::new("accounts.load", "account_id", IdArg::name("id"));
        let account = Account {
            email: "x".to_string(),
        };
        let args = CallArgs::new()
            .arg("id", 1u64)
            .arg_value("account", ArgValue::opaque(account));
        assert!(matches!(
            build_key(&options, &args),
            Err(GCacheError::KeyConstructionFailed(_))
        ));
    }

    #[test]
    fn test_build_key_adapter_error_degrades() {
        let options = CachedOptions::new("users.load", "user_id", IdArg::name("user"))
            .arg_adapter("flags", |_| anyhow::bail!("bad flags"));
        let args = CallArgs::new().arg("user", 1u64).arg("flags", 3u8);
        let err = build_key(&options, &args).unwrap_err();
        assert!(matches!(err, GCacheError::KeyConstructionFailed(_)));
        assert!(err.to_string().contains("bad flags"));
    }

    #[test]
    fn test_validate_rejects_separator_characters() {
        let options = CachedOptions::new("users.load", "user#id", IdArg::name("user"));
        assert!(options.validate().is_err());
        let options = CachedOptions::new("users#load", "user_id", IdArg::name("user"));
        assert!(options.validate().is_err());
        let options = CachedOptions::new("users.load", "user_id", IdArg::name("user"));
        assert!(options.validate().is_ok());
    }
}
