//! In-memory shapes of the parsed conduit configuration. The
//! grammar itself is an external collaborator; these are plain
//! `Deserialize` structs an external parser (TOML, JSON, the real
//! `.coldsyncrc` grammar) decodes into, kept front-end agnostic.

use serde::Deserialize;

/// The stage at which a conduit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Install,
    Fetch,
    Dump,
    Sync,
    Init,
}

impl Flavor {
    fn bit(self) -> u8 {
        match self {
            Flavor::Install => 0x01,
            Flavor::Fetch => 0x02,
            Flavor::Dump => 0x04,
            Flavor::Sync => 0x08,
            Flavor::Init => 0x10,
        }
    }

    /// Whether this flavor enables the SPC side-channel (sync only).
    pub fn enables_spc(self) -> bool {
        matches!(self, Flavor::Sync)
    }
}

/// A mask of flavors a conduit block is enabled for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<Flavor>")]
pub struct FlavorMask(u8);

impl FlavorMask {
    pub fn new(flavors: &[Flavor]) -> Self {
        FlavorMask(flavors.iter().fold(0u8, |acc, f| acc | f.bit()))
    }

    pub fn contains(&self, flavor: Flavor) -> bool {
        self.0 & flavor.bit() != 0
    }
}

impl TryFrom<Vec<Flavor>> for FlavorMask {
    type Error = std::convert::Infallible;

    fn try_from(flavors: Vec<Flavor>) -> Result<Self, Self::Error> {
        Ok(FlavorMask::new(&flavors))
    }
}

/// A (creator, type, flags) match rule. A zero value matches any creator or
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct MatchRule {
    pub creator: u32,
    pub db_type: u32,
}

impl MatchRule {
    pub fn matches(&self, creator: u32, db_type: u32) -> bool {
        (self.creator == 0 || self.creator == creator) && (self.db_type == 0 || self.db_type == db_type)
    }
}

/// A preference item (creator, id) a conduit wants snapshotted into its
/// stdin -- one entry of a conduit block's preference-item list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PreferenceRef {
    pub creator: u32,
    pub id: u32,
}

/// One entry in the ordered conduit list.
#[derive(Debug, Clone, Deserialize)]
pub struct ConduitBlock {
    pub flavors: FlavorMask,
    /// Empty means "matches any database" (database-independent events:
    /// init/fetch/dump with no dbinfo).
    pub rules: Vec<MatchRule>,
    /// Executable path, or a built-in name (`[generic]`/`[dummy]`) with the
    /// brackets stripped at parse time.
    pub path: ConduitPath,
    pub working_dir: Option<String>,
    pub headers: Vec<(String, String)>,
    pub preferences: Vec<PreferenceRef>,
    pub default: bool,
    pub final_conduit: bool,
}

impl ConduitBlock {
    /// True for an empty external path: a configured "do nothing" slot.
    pub fn is_do_nothing(&self) -> bool {
        matches!(&self.path, ConduitPath::External(p) if p.is_empty())
    }

    pub fn matches_rules(&self, creator: u32, db_type: u32) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|r| r.matches(creator, db_type))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConduitPath {
    External(String),
    Generic,
    Dummy,
}
