//! Versioned-entity abstraction
//!
//! Documents and blocks share the same in-memory shape: a map of loaded
//! item versions, a map of built outputs, and two cursors (the selected
//! version and the latest version). `EntityState` holds that shape and
//! enforces that everything placed in it belongs to the declared id.
//!
//! ```text
//! VersionToken::Version(v) -> v
//! VersionToken::Latest     -> latest cursor   | NotLoaded
//! VersionToken::Selected   -> selected cursor | NotSelected
//! ```

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use tracing::error;
use wikivc_core::{Droplet, Error, Result};

/// Which version of an entity an operation addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum VersionToken {
    /// The latest version
    #[default]
    Latest,
    /// The version most recently selected
    Selected,
    /// A concrete version
    Version(Droplet),
}

impl From<Droplet> for VersionToken {
    fn from(version: Droplet) -> Self {
        VersionToken::Version(version)
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionToken::Latest => f.write_str("latest"),
            VersionToken::Selected => f.write_str("selected"),
            VersionToken::Version(v) => write!(f, "{}", v),
        }
    }
}

/// Anything stored per version inside an `EntityState`
pub trait Versioned {
    /// Identity shared by every version of the entity
    type Id: Clone + PartialEq + fmt::Display + fmt::Debug;

    /// Identity of the entity this version belongs to
    fn entity_id(&self) -> Self::Id;

    /// Version stamp
    fn version(&self) -> &Droplet;

    /// Record whether this version is the latest one
    fn set_latest(&mut self, _is_latest: bool) {}
}

/// Placement options for `set_item` / `set_build`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Move the selected cursor to this version
    pub select: bool,
    /// Move the latest cursor to this version
    pub is_latest: bool,
}

impl SetOptions {
    /// Select the version and mark it latest
    pub fn latest() -> Self {
        Self {
            select: true,
            is_latest: true,
        }
    }

    /// Select the version without touching the latest cursor
    pub fn selected() -> Self {
        Self {
            select: true,
            is_latest: false,
        }
    }
}

/// In-memory state of one versioned entity
#[derive(Debug, Clone)]
pub struct EntityState<I: Versioned, B> {
    id: I::Id,
    item_map: BTreeMap<Droplet, I>,
    build_map: BTreeMap<Droplet, B>,
    selected_version: Option<Droplet>,
    latest_version: Option<Droplet>,
}

impl<I, B> EntityState<I, B>
where
    I: Versioned,
    B: Versioned<Id = I::Id>,
{
    /// Empty state for the given id
    pub fn new(id: I::Id) -> Self {
        Self {
            id,
            item_map: BTreeMap::new(),
            build_map: BTreeMap::new(),
            selected_version: None,
            latest_version: None,
        }
    }

    /// Declared id
    pub fn id(&self) -> &I::Id {
        &self.id
    }

    /// Version of the selected cursor
    pub fn selected_version(&self) -> Option<&Droplet> {
        self.selected_version.as_ref()
    }

    /// Version of the latest cursor
    pub fn latest_version(&self) -> Option<&Droplet> {
        self.latest_version.as_ref()
    }

    /// Resolve a token to a concrete version
    pub fn resolve_version(&self, token: &VersionToken) -> Result<Droplet> {
        match token {
            VersionToken::Version(v) => Ok(v.clone()),
            VersionToken::Latest => self
                .latest_version
                .clone()
                .ok_or_else(|| Error::NotLoaded(self.id.to_string())),
            VersionToken::Selected => self
                .selected_version
                .clone()
                .ok_or_else(|| Error::NotSelected(self.id.to_string())),
        }
    }

    /// Move the selected cursor
    pub fn select(&mut self, version: Droplet) {
        self.selected_version = Some(version);
    }

    /// Store a loaded or freshly written item
    ///
    /// Marking an item latest clears the flag on the previous latest item.
    pub fn set_item(&mut self, mut item: I, options: SetOptions) -> Result<()> {
        let actual = item.entity_id();
        if actual != self.id {
            error!(expected = %self.id, actual = %actual, "item id mismatch");
            return Err(Error::id_mismatch(&self.id, actual));
        }
        let version = item.version().clone();
        if options.is_latest {
            if let Some(prev) = self.latest_version.take() {
                if prev != version {
                    if let Some(old) = self.item_map.get_mut(&prev) {
                        old.set_latest(false);
                    }
                    if let Some(old) = self.build_map.get_mut(&prev) {
                        old.set_latest(false);
                    }
                }
            }
            item.set_latest(true);
            self.latest_version = Some(version.clone());
        }
        if options.select {
            self.selected_version = Some(version.clone());
        }
        self.item_map.insert(version, item);
        Ok(())
    }

    /// Cache a built output
    pub fn set_build(&mut self, build: B, options: SetOptions) -> Result<()> {
        let actual = build.entity_id();
        if actual != self.id {
            error!(expected = %self.id, actual = %actual, "build id mismatch");
            return Err(Error::id_mismatch(&self.id, actual));
        }
        let version = build.version().clone();
        if options.is_latest {
            self.latest_version = Some(version.clone());
        }
        if options.select {
            self.selected_version = Some(version.clone());
        }
        self.build_map.insert(version, build);
        Ok(())
    }

    /// Loaded item for a token; `NotFound` if that version is not in memory
    pub fn item(&self, token: &VersionToken) -> Result<&I> {
        let version = self.resolve_version(token)?;
        self.item_map
            .get(&version)
            .ok_or_else(|| Error::not_found(format!("{} version {}", self.id, version)))
    }

    /// Mutable access to a loaded item
    ///
    /// Invalidates the cached build of that version.
    pub fn item_mut(&mut self, token: &VersionToken) -> Result<&mut I> {
        let version = self.resolve_version(token)?;
        self.build_map.remove(&version);
        let id = &self.id;
        self.item_map
            .get_mut(&version)
            .ok_or_else(|| Error::not_found(format!("{} version {}", id, version)))
    }

    /// Cached build for a token, if present
    pub fn cached_build(&self, token: &VersionToken) -> Option<&B> {
        let version = self.resolve_version(token).ok()?;
        self.build_map.get(&version)
    }

    /// Whether a version is loaded
    pub fn has_item(&self, version: &Droplet) -> bool {
        self.item_map.contains_key(version)
    }

    /// Loaded items in version order
    pub fn items(&self) -> impl Iterator<Item = &I> {
        self.item_map.values()
    }
}

/// Entity with a raw storage form, a decoded item form and a built form
#[async_trait]
pub trait VersionedEntity: Send + Sync {
    /// Storage representation
    type RawItem: Send;
    /// Decoded version record
    type Item: Versioned + Send + Sync;
    /// Resolved output
    type Build: Versioned<Id = <Self::Item as Versioned>::Id> + Send + Sync;

    /// In-memory state
    fn state(&self) -> &EntityState<Self::Item, Self::Build>;

    /// Mutable in-memory state
    fn state_mut(&mut self) -> &mut EntityState<Self::Item, Self::Build>;

    /// Fetch one version from the store into the state; returns its version
    async fn load_item(&mut self, version: VersionToken, consistent: bool) -> Result<Droplet>;

    /// Resolve a loaded version into its output form
    fn build(&mut self, version: &VersionToken) -> Result<Self::Build>;

    /// Decode a raw item
    fn to_item(&self, raw: &Self::RawItem) -> Result<Self::Item>;

    /// Encode an item for storage
    fn to_raw_item(&self, item: &Self::Item) -> Result<Self::RawItem>;
}
