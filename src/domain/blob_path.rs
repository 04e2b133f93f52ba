use chrono::{DateTime, Timelike, Utc};
use uuid::Uuid;

use crate::domain::models::{BlobKind, BlobNaming, BlobTarget};

pub const BLOB_EXTENSION: &str = "txt";

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendNaming {
    /// Every invocation appends to the same configured blob.
    Fixed(String),
    /// Each invocation starts its own append blob.
    PerInvocation,
    /// One blob per time bucket of the given size in minutes.
    TimeBucket { minutes: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    Block,
    Append(AppendNaming),
}

impl WriteMode {
    pub fn is_append(&self) -> bool {
        matches!(self, WriteMode::Append(_))
    }
}

/// Start of the time bucket containing `at`, rendered as `HH-MM`.
pub fn bucket_key(at: DateTime<Utc>, minutes: u32) -> String {
    let minutes = minutes.clamp(1, MINUTES_PER_DAY);
    let minute_of_day = at.hour() * 60 + at.minute();
    let start = minute_of_day / minutes * minutes;
    format!("{:02}-{:02}", start / 60, start % 60)
}

fn file_name(stem: impl std::fmt::Display) -> String {
    format!("{}.{}", stem, BLOB_EXTENSION)
}

/// Computes blob targets for one container and destination folder.
#[derive(Debug, Clone)]
pub struct BlobPathBuilder {
    container: String,
    folder: String,
}

impl BlobPathBuilder {
    pub fn new(container: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            folder: folder.into(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn block_target(&self, at: DateTime<Utc>, id: Uuid) -> BlobTarget {
        BlobTarget {
            container: self.container.clone(),
            folder: self.folder.clone(),
            date: at.date_naive(),
            name: file_name(id),
            kind: BlobKind::Block,
            naming: BlobNaming::Unique,
        }
    }

    /// `invocation` names the blob in `PerInvocation` mode and is ignored otherwise.
    pub fn append_target(&self, at: DateTime<Utc>, naming: &AppendNaming, invocation: Uuid) -> BlobTarget {
        let (name, naming) = match naming {
            AppendNaming::Fixed(name) if name.ends_with(&format!(".{}", BLOB_EXTENSION)) => {
                (name.clone(), BlobNaming::Fixed)
            }
            AppendNaming::Fixed(name) => (file_name(name), BlobNaming::Fixed),
            AppendNaming::PerInvocation => (file_name(invocation), BlobNaming::Unique),
            AppendNaming::TimeBucket { minutes } => (file_name(bucket_key(at, *minutes)), BlobNaming::TimeBucket),
        };

        BlobTarget {
            container: self.container.clone(),
            folder: self.folder.clone(),
            date: at.date_naive(),
            name,
            kind: BlobKind::Append,
            naming,
        }
    }

    /// Target for one write, given the mode and the invocation's pinned start time.
    pub fn target_for(&self, mode: &WriteMode, at: DateTime<Utc>, invocation: Uuid) -> BlobTarget {
        match mode {
            WriteMode::Block => self.block_target(at, Uuid::new_v4()),
            WriteMode::Append(naming) => self.append_target(at, naming, invocation),
        }
    }
}
