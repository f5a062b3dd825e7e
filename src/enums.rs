use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// A level of the IDC hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Version,
    Collection,
    Patient,
    Study,
    Series,
    Instance,
}

impl Level {
    /// The level of this level's children. Instances are leaves.
    pub fn child(self) -> Option<Level> {
        match self {
            Level::Version => Some(Level::Collection),
            Level::Collection => Some(Level::Patient),
            Level::Patient => Some(Level::Study),
            Level::Study => Some(Level::Series),
            Level::Series => Some(Level::Instance),
            Level::Instance => None,
        }
    }

    pub fn parent(self) -> Option<Level> {
        match self {
            Level::Version => None,
            Level::Collection => Some(Level::Version),
            Level::Patient => Some(Level::Collection),
            Level::Study => Some(Level::Patient),
            Level::Series => Some(Level::Study),
            Level::Instance => Some(Level::Series),
        }
    }

    /// Level of a node whose lineage has the given depth.
    pub fn at_depth(depth: usize) -> Option<Level> {
        match depth {
            0 => Some(Level::Version),
            1 => Some(Level::Collection),
            2 => Some(Level::Patient),
            3 => Some(Level::Study),
            4 => Some(Level::Series),
            5 => Some(Level::Instance),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Version => "version",
            Level::Collection => "collection",
            Level::Patient => "patient",
            Level::Study => "study",
            Level::Series => "series",
            Level::Instance => "instance",
        }
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream source of DICOM data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// TCIA radiology
    Tcia,
    /// TCIA pathology
    Path,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Tcia, SourceKind::Path];
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SourceKind::Tcia => "tcia",
            SourceKind::Path => "path",
        })
    }
}

/// One value per [SourceKind].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerSource<T> {
    pub tcia: T,
    pub path: T,
}

/// Which sources contributed to a node.
pub type Sources = PerSource<bool>;

impl<T> PerSource<T> {
    pub fn get(&self, kind: SourceKind) -> &T {
        match kind {
            SourceKind::Tcia => &self.tcia,
            SourceKind::Path => &self.path,
        }
    }

    pub fn get_mut(&mut self, kind: SourceKind) -> &mut T {
        match kind {
            SourceKind::Tcia => &mut self.tcia,
            SourceKind::Path => &mut self.path,
        }
    }

    pub fn from_fn<F: FnMut(SourceKind) -> T>(mut f: F) -> Self {
        Self {
            tcia: f(SourceKind::Tcia),
            path: f(SourceKind::Path),
        }
    }

    pub fn zip_with<U, R, F: FnMut(&T, &U) -> R>(&self, other: &PerSource<U>, mut f: F) -> PerSource<R> {
        PerSource {
            tcia: f(&self.tcia, &other.tcia),
            path: f(&self.path, &other.path),
        }
    }
}

impl Sources {
    pub fn only(kind: SourceKind) -> Self {
        Self::from_fn(|k| k == kind)
    }

    pub fn any(&self) -> bool {
        self.tcia || self.path
    }

    pub fn or(&self, other: &Sources) -> Sources {
        self.zip_with(other, |a, b| *a || *b)
    }

    /// The sources which are set.
    pub fn kinds(&self) -> impl Iterator<Item = SourceKind> + '_ {
        SourceKind::ALL.into_iter().filter(|k| *self.get(*k))
    }
}
