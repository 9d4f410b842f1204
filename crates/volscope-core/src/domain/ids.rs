//! Domain identifiers (strongly-typed IDs).
//!
//! # 二種類の ID
//! - **`Id<T>`**: クライアント側で生成する ULID（poll attempt の相関用）
//! - **`RemoteId<T>`**: サーバーが払い出す opaque な ID（analysis, symbol job, symbol）
//!
//! どちらも Phantom type パターンで `T` をマーカーにして、
//! `AnalysisId` と `SymbolId` を取り違えるとコンパイルエラーになるようにしています。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display / ログで使う名前（例: "attempt", "analysis"）
    fn kind() -> &'static str;
}

/// Client-generated identifier backed by a ULID.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", T::kind(), self.ulid)
    }
}

/// Server-issued identifier.
///
/// The service hands these out (upload → `analysis_id`, vmlinux upload → job id)
/// and the client only ever echoes them back in URL paths, so the value is kept
/// as an opaque string. Numeric ids in JSON are accepted and stringified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteId<T: IdMarker> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> RemoteId<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> fmt::Display for RemoteId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T: IdMarker> FromStr for RemoteId<T> {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl<T: IdMarker> Serialize for RemoteId<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for RemoteId<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        let value = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Number(n) => n.to_string(),
        };
        Ok(Self::new(value))
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Poll attempt のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attempt {}

impl IdMarker for Attempt {
    fn kind() -> &'static str {
        "attempt"
    }
}

/// Analysis（アップロード済みダンプ）のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Analysis {}

impl IdMarker for Analysis {
    fn kind() -> &'static str {
        "analysis"
    }
}

/// Symbol 生成ジョブのマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymbolJob {}

impl IdMarker for SymbolJob {
    fn kind() -> &'static str {
        "symbol-job"
    }
}

/// Symbol ファイルのマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {}

impl IdMarker for Symbol {
    fn kind() -> &'static str {
        "symbol"
    }
}

// ========================================
// Type Alias
// ========================================

/// Identifier of one client-side poll of a job attempt (log correlation only).
pub type AttemptId = Id<Attempt>;

/// Identifier of an uploaded dump (the `analysis_id` returned by upload).
pub type AnalysisId = RemoteId<Analysis>;

/// Identifier of a server-side symbol generation job.
pub type SymbolJobId = RemoteId<SymbolJob>;

/// Identifier of a stored symbol/ISF file.
pub type SymbolId = RemoteId<Symbol>;

/// Name of an analysis plugin, e.g. `windows.pslist.PsList`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginName(String);

impl PluginName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for PluginName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Process id inside the analysed memory image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(u32);

impl Pid {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Pid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}
