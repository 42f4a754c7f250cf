use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity under which providers are registered and values are requested.
///
/// Three kinds of identity are supported:
///
/// - [`Token::Type`] is the nominal identity of a Rust type, see [`Token::of`].
/// - [`Token::Name`] is a plain string, compared by value.
/// - [`Token::Symbol`] is a unique named token compared by identity. Two symbols
///   created with the same description are still different tokens.
///
/// # Examples
///
/// ```rust
/// use anode::Token;
///
/// struct Database;
///
/// assert_eq!(Token::of::<Database>(), Token::of::<Database>());
/// assert_eq!(Token::name("url"), Token::from("url"));
/// assert_ne!(Token::symbol("url"), Token::symbol("url"));
/// ```
#[derive(Clone)]
pub enum Token {
    Type(TypeId, &'static str),
    Name(Arc<str>),
    Symbol(u64, Arc<str>),
}

static NEXT_SYMBOL: AtomicU64 = AtomicU64::new(1);

impl Token {
    /// Returns the nominal token of type `T`.
    pub fn of<T>() -> Self
    where
        T: ?Sized + 'static,
    {
        Self::Type(TypeId::of::<T>(), type_name::<T>())
    }

    /// Returns a string token.
    pub fn name(name: impl Into<Arc<str>>) -> Self {
        Self::Name(name.into())
    }

    /// Creates a new process-unique token with a description used for diagnostics.
    pub fn symbol(description: impl Into<Arc<str>>) -> Self {
        Self::Symbol(NEXT_SYMBOL.fetch_add(1, Ordering::Relaxed), description.into())
    }

    /// Human readable form of the token used in error messages and logs.
    pub fn describe(&self) -> &str {
        match self {
            Self::Type(_, name) => short_type_name(name),
            Self::Name(name) => name,
            Self::Symbol(_, description) => description,
        }
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Type(l, _), Self::Type(r, _)) => l == r,
            (Self::Name(l), Self::Name(r)) => l == r,
            (Self::Symbol(l, _), Self::Symbol(r, _)) => l == r,
            _ => false,
        }
    }
}

impl Eq for Token {}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Type(id, _) => id.hash(state),
            Self::Name(name) => name.hash(state),
            Self::Symbol(id, _) => id.hash(state),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(_, name) => write!(f, "Type({name})"),
            Self::Name(name) => write!(f, "Name({name:?})"),
            Self::Symbol(id, description) => write!(f, "Symbol({description}#{id})"),
        }
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self::name(value)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self::name(value)
    }
}

impl From<&Token> for Token {
    fn from(value: &Token) -> Self {
        value.clone()
    }
}

/// Strips module paths from a type name, keeping generic arguments readable.
fn short_type_name(name: &'static str) -> &'static str {
    let end = name.find('<').unwrap_or(name.len());
    match name[..end].rfind("::") {
        Some(pos) => &name[pos + 2..],
        None => name,
    }
}

/// Typed symbol token.
///
/// Resolving an `InjectionToken<T>` through the typed container helpers
/// downcasts the produced value to `T`.
///
/// ```rust
/// use anode::InjectionToken;
///
/// let url = InjectionToken::<String>::new("URL");
/// assert_eq!(url.token().describe(), "URL");
/// ```
pub struct InjectionToken<T> {
    token: Token,
    _marker: PhantomData<fn() -> T>,
}

impl<T> InjectionToken<T> {
    pub fn new(description: impl Into<Arc<str>>) -> Self {
        Self {
            token: Token::symbol(description),
            _marker: PhantomData,
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }
}

impl<T> Clone for InjectionToken<T> {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for InjectionToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InjectionToken").field(&self.token).finish()
    }
}

impl<T> From<&InjectionToken<T>> for Token {
    fn from(value: &InjectionToken<T>) -> Self {
        value.token.clone()
    }
}

impl<T> From<InjectionToken<T>> for Token {
    fn from(value: InjectionToken<T>) -> Self {
        value.token
    }
}

/// Token reference that may be evaluated lazily.
///
/// Forward references let two definitions refer to each other regardless of
/// the order in which their tokens become available.
#[derive(Clone)]
pub enum TokenRef {
    Token(Token),
    Forward(Arc<dyn Fn() -> Token + Send + Sync>),
}

impl TokenRef {
    pub fn resolve(&self) -> Token {
        match self {
            Self::Token(token) => token.clone(),
            Self::Forward(f) => f(),
        }
    }

    pub fn is_forward(&self) -> bool {
        matches!(self, Self::Forward(_))
    }
}

impl fmt::Debug for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(token) => token.fmt(f),
            Self::Forward(_) => f.write_str("Forward(..)"),
        }
    }
}

impl From<Token> for TokenRef {
    fn from(value: Token) -> Self {
        Self::Token(value)
    }
}

impl From<&Token> for TokenRef {
    fn from(value: &Token) -> Self {
        Self::Token(value.clone())
    }
}

impl From<&str> for TokenRef {
    fn from(value: &str) -> Self {
        Self::Token(Token::name(value))
    }
}

impl From<String> for TokenRef {
    fn from(value: String) -> Self {
        Self::Token(Token::name(value))
    }
}

impl<T> From<&InjectionToken<T>> for TokenRef {
    fn from(value: &InjectionToken<T>) -> Self {
        Self::Token(value.token.clone())
    }
}

/// Creates a forward reference to a token.
///
/// ```rust
/// use anode::{Token, forward_ref};
///
/// struct Later;
///
/// let token = forward_ref(|| Token::of::<Later>());
/// assert_eq!(token.resolve(), Token::of::<Later>());
/// ```
pub fn forward_ref<F>(f: F) -> TokenRef
where
    F: Fn() -> Token + Send + Sync + 'static,
{
    TokenRef::Forward(Arc::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sample;

    #[test]
    fn test_short_type_name() {
        assert_eq!(Token::of::<Sample>().describe(), "Sample");
        assert_eq!(short_type_name("a::b::Vec<a::C>"), "Vec<a::C>");
        assert_eq!(short_type_name("u32"), "u32");
    }

    #[test]
    fn test_symbol_identity() {
        let a = Token::symbol("x");
        assert_eq!(a, a.clone());
        assert_ne!(a, Token::symbol("x"));
        assert_ne!(a, Token::name("x"));
    }
}
