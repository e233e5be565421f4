use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize};
use std::{collections::HashSet, fmt, sync::Mutex};

// Flyweight pattern
// Leaks memory if and only if no name with the same spelling exists.
// This allows us to pass exchange and pair names as static strs, which in
// turn enables implementing Copy on SeriesKey.
fn intern<R: AsRef<str>>(name: R) -> &'static str {
    static SET: Lazy<Mutex<HashSet<&'static str>>> = Lazy::new(|| Mutex::new(HashSet::new()));
    let mut set = SET.lock().unwrap();
    if !set.contains(name.as_ref()) {
        let leaked: &'static str = Box::leak(name.as_ref().to_owned().into_boxed_str());
        set.insert(leaked);
    }

    *set.get(name.as_ref()).unwrap()
}

/// Identifier of an upstream market-data provider, e.g. `coinbase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Exchange(&'static str);

impl Exchange {
    pub fn new<R: AsRef<str>>(name: R) -> Self {
        Exchange(intern(name))
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl<'de> Deserialize<'de> for Exchange {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Exchange::new)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trading pair in the exchange's own spelling, e.g. `BTC-USD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Pair(&'static str);

impl Pair {
    pub fn new<R: AsRef<str>>(name: R) -> Self {
        Pair(intern(name))
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl<'de> Deserialize<'de> for Pair {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Pair::new)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
