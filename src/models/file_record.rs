//! Represents an uploaded file and where its bytes live.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A stored file as persisted in the metadata store.
///
/// The record does not hold content bytes; `bucket` and [`FileRecord::object_key`]
/// address the object that does.
#[derive(Serialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Store-assigned primary key.
    pub id: i64,

    /// Identifier handed to the uploader; the only key clients use.
    pub identifier: String,

    /// Object-store bucket holding the content.
    pub bucket: String,

    /// Date partition the object was written under (`YYYY/MM/DD`).
    pub relative_path: String,

    /// Original base name, without extension.
    pub file_name: String,

    /// Original extension with its leading dot, or empty.
    pub extension: String,

    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Original file name as uploaded.
    pub fn display_name(&self) -> String {
        format!("{}{}", self.file_name, self.extension)
    }

    /// Key of the object within `bucket`.
    pub fn object_key(&self) -> String {
        object_key(&self.relative_path, &self.file_name, &self.extension)
    }
}

/// Values for a record that has not been inserted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFileRecord {
    pub identifier: String,
    pub bucket: String,
    pub relative_path: String,
    pub file_name: String,
    pub extension: String,
}

impl NewFileRecord {
    pub fn object_key(&self) -> String {
        object_key(&self.relative_path, &self.file_name, &self.extension)
    }
}

/// An uploaded file name split into base name and extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredName {
    pub base_name: String,
    pub extension: String,
}

impl StoredName {
    /// Split a client-supplied file name.
    ///
    /// Directory components (either separator) are dropped. The extension
    /// starts at the last dot unless that dot opens the name, so `.env` has
    /// no extension and `archive.tar.gz` has `.gz`. Returns `None` when
    /// nothing usable is left.
    pub fn parse(raw: &str) -> Option<Self> {
        let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
        if name.is_empty() || name == "." || name == ".." {
            return None;
        }

        let (base_name, extension) = match name.rfind('.') {
            Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
            _ => (name, ""),
        };

        Some(Self {
            base_name: base_name.to_string(),
            extension: extension.to_string(),
        })
    }
}

/// Date partition for objects written on `date`.
pub fn relative_path_for(date: NaiveDate) -> String {
    date.format("%Y/%m/%d").to_string()
}

fn object_key(relative_path: &str, file_name: &str, extension: &str) -> String {
    format!("{}/{}{}", relative_path, file_name, extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(raw: &str) -> (String, String) {
        let name = StoredName::parse(raw).unwrap();
        (name.base_name, name.extension)
    }

    #[test]
    fn splits_extension_at_last_dot() {
        assert_eq!(split("report.pdf"), ("report".into(), ".pdf".into()));
        assert_eq!(split("archive.tar.gz"), ("archive.tar".into(), ".gz".into()));
        assert_eq!(split("README"), ("README".into(), "".into()));
    }

    #[test]
    fn dotfiles_have_no_extension() {
        assert_eq!(split(".env"), (".env".into(), "".into()));
    }

    #[test]
    fn directory_components_are_dropped() {
        assert_eq!(split("a/b/c.txt"), ("c".into(), ".txt".into()));
        assert_eq!(split(r"C:\Users\me\photo.jpg"), ("photo".into(), ".jpg".into()));
    }

    #[test]
    fn unusable_names_are_rejected() {
        for raw in ["", ".", "..", "dir/", "dir/.."] {
            assert!(StoredName::parse(raw).is_none(), "{raw}");
        }
    }

    #[test]
    fn date_partition_is_zero_padded() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(relative_path_for(date), "2024/03/07");
    }

    #[test]
    fn record_addresses_its_object() {
        let record = FileRecord {
            id: 1,
            identifier: "id".into(),
            bucket: "media".into(),
            relative_path: "2024/03/07".into(),
            file_name: "report".into(),
            extension: ".pdf".into(),
            created_at: Utc::now(),
        };
        assert_eq!(record.display_name(), "report.pdf");
        assert_eq!(record.object_key(), "2024/03/07/report.pdf");
    }
}
