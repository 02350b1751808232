// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs::{rename, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::mpsc::Receiver,
};

use crate::{
    engine::{
        store::{DriveList, ListOptions, MemoryStore, Store, WatchEvent},
        types::{Drive, EventReason, EventType, ObjectRef, RecordedEvent, Volume},
    },
    node::errors::{DirectCsiError, DirectCsiResult},
};

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct StateFile {
    drives: Vec<Drive>,
    volumes: Vec<Volume>,
}

/// A store kept in a JSON file, for running the host side tools without
/// a cluster. Every accepted write rewrites the file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    /// Load the store from path. A missing file is an empty store.
    pub fn open(path: &Path) -> DirectCsiResult<FileStore> {
        let state = match File::open(path) {
            Ok(file) => serde_json::from_reader::<_, StateFile>(BufReader::new(file))
                .map_err(|err| DirectCsiError::from(err).chain(format!("reading {}", path.display())))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => StateFile::default(),
            Err(err) => return Err(err.into()),
        };
        debug!(
            "Loaded {} drives and {} volumes from {}",
            state.drives.len(),
            state.volumes.len(),
            path.display()
        );
        Ok(FileStore {
            path: path.to_owned(),
            inner: MemoryStore::with_objects(state.drives, state.volumes),
        })
    }

    fn persist(&self) -> DirectCsiResult<()> {
        let state = StateFile {
            drives: self.inner.drives(),
            volumes: self.inner.volumes(),
        };
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, &state)?;
            writer.flush()?;
        }
        rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.inner.events()
    }
}

impl Store for FileStore {
    fn list_drives(&self, options: &ListOptions) -> DirectCsiResult<DriveList> {
        self.inner.list_drives(options)
    }

    fn get_drive(&self, name: &str) -> DirectCsiResult<Drive> {
        self.inner.get_drive(name)
    }

    fn create_drive(&self, drive: &Drive) -> DirectCsiResult<Drive> {
        let drive = self.inner.create_drive(drive)?;
        self.persist()?;
        Ok(drive)
    }

    fn update_drive(&self, drive: &Drive) -> DirectCsiResult<Drive> {
        let drive = self.inner.update_drive(drive)?;
        self.persist()?;
        Ok(drive)
    }

    fn delete_drive(&self, name: &str) -> DirectCsiResult<()> {
        self.inner.delete_drive(name)?;
        self.persist()
    }

    fn watch_drives(&self) -> DirectCsiResult<Receiver<WatchEvent>> {
        self.inner.watch_drives()
    }

    fn get_volume(&self, name: &str) -> DirectCsiResult<Volume> {
        self.inner.get_volume(name)
    }

    fn update_volume(&self, volume: &Volume) -> DirectCsiResult<Volume> {
        let volume = self.inner.update_volume(volume)?;
        self.persist()?;
        Ok(volume)
    }

    fn event(
        &self,
        object: &ObjectRef,
        event_type: EventType,
        reason: EventReason,
        message: &str,
    ) -> DirectCsiResult<()> {
        self.inner.event(object, event_type, reason, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ObjectMeta;

    #[test]
    /// Writes survive reopening the file.
    fn test_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");

        let store = FileStore::open(&path).unwrap();
        assert!(store.list_drives(&ListOptions::default()).unwrap().items.is_empty());
        let mut drive = store
            .create_drive(&Drive {
                metadata: ObjectMeta::new("a"),
                ..Default::default()
            })
            .unwrap();
        drive.status.model = "QEMU".into();
        store.update_drive(&drive).unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get_drive("a").unwrap().status.model, "QEMU");
    }

    #[test]
    fn test_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_matches!(FileStore::open(&path), Err(DirectCsiError::Chained(..)));
    }
}
