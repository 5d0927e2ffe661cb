use crate::errors::SequencerError;
use crate::logging::append_run_log;
use crate::recording::model::{
    normalize_commands, recording_id_for, CommandInput, ImportedRecording, Recording,
};
use crate::runtime::{Clock, FileSystem};
use chrono::{DateTime, Local, NaiveDateTime};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

type StoreResult<T> = Result<T, SequencerError>;
type RecordingMap = BTreeMap<String, Recording>;

/// Field replacements for [`RecordingStore::update`]; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct RecordingUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub commands: Option<Vec<CommandInput>>,
    pub start_directory: Option<Option<String>>,
}

/// JSON-file backed collection of recordings keyed by id.
///
/// Every mutation serializes the would-be next state, writes it to disk and
/// only then replaces the in-memory map, so a failed write changes nothing.
pub struct RecordingStore {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    recordings: Mutex<RecordingMap>,
}

impl RecordingStore {
    pub fn open(
        path: impl AsRef<Path>,
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let recordings = if fs.exists(&path) {
            let raw = fs.read_to_string(&path)?;
            parse_store(&raw)?
        } else {
            RecordingMap::new()
        };
        append_run_log(
            "info",
            "recording_store.opened",
            json!({
                "path": path.display().to_string(),
                "recordings": recordings.len(),
            }),
        );
        Ok(Self {
            path,
            fs,
            clock,
            recordings: Mutex::new(recordings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, RecordingMap> {
        self.recordings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now(&self) -> NaiveDateTime {
        DateTime::<Local>::from(self.clock.now()).naive_local()
    }

    fn commit(&self, current: &mut MutexGuard<'_, RecordingMap>, next: RecordingMap) -> StoreResult<()> {
        let body = serde_json::to_string_pretty(&next)
            .map_err(|e| SequencerError::Io(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                self.fs.create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        self.fs.write_string(&tmp, &body)?;
        self.fs.rename(&tmp, &self.path)?;
        **current = next;
        Ok(())
    }

    pub fn create(
        &self,
        name: &str,
        commands: Vec<CommandInput>,
        description: &str,
        start_directory: Option<String>,
    ) -> StoreResult<String> {
        let mut current = self.lock();
        let created_at = self.now();
        let id = unique_id(&current, created_at);
        let recording = Recording {
            id: id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            commands: normalize_commands(commands),
            start_directory,
            created_at,
            last_played: None,
            play_count: 0,
        };
        let command_count = recording.commands.len();
        let mut next = current.clone();
        next.insert(id.clone(), recording);
        self.commit(&mut current, next)?;
        append_run_log(
            "info",
            "recording_store.created",
            json!({ "id": id, "name": name, "commands": command_count }),
        );
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Recording> {
        self.lock().get(id).cloned()
    }

    /// All recordings, newest first.
    pub fn list_all(&self) -> Vec<Recording> {
        let mut all = self.lock().values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        all
    }

    pub fn update(&self, id: &str, update: RecordingUpdate) -> StoreResult<bool> {
        let mut current = self.lock();
        let Some(existing) = current.get(id) else {
            return Ok(false);
        };
        let mut recording = existing.clone();
        if let Some(name) = update.name {
            recording.name = name;
        }
        if let Some(description) = update.description {
            recording.description = description;
        }
        if let Some(commands) = update.commands {
            recording.commands = normalize_commands(commands);
        }
        if let Some(start_directory) = update.start_directory {
            recording.start_directory = start_directory;
        }
        let mut next = current.clone();
        next.insert(id.to_string(), recording);
        self.commit(&mut current, next)?;
        append_run_log("info", "recording_store.updated", json!({ "id": id }));
        Ok(true)
    }

    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        let mut current = self.lock();
        if !current.contains_key(id) {
            return Ok(false);
        }
        let mut next = current.clone();
        next.remove(id);
        self.commit(&mut current, next)?;
        append_run_log("info", "recording_store.deleted", json!({ "id": id }));
        Ok(true)
    }

    pub fn duplicate(&self, id: &str) -> StoreResult<Option<String>> {
        let Some(original) = self.get(id) else {
            return Ok(None);
        };
        let commands = original
            .commands
            .into_iter()
            .map(CommandInput::from)
            .collect::<Vec<_>>();
        let new_id = self.create(
            &format!("{} (Copy)", original.name),
            commands,
            &original.description,
            original.start_directory,
        )?;
        Ok(Some(new_id))
    }

    /// Bump the play counter and stamp `last_played`. Returns `false` for an
    /// unknown id.
    pub fn track_play(&self, id: &str) -> StoreResult<bool> {
        let mut current = self.lock();
        let Some(existing) = current.get(id) else {
            return Ok(false);
        };
        let mut recording = existing.clone();
        recording.play_count = recording.play_count.saturating_add(1);
        recording.last_played = Some(self.now());
        let play_count = recording.play_count;
        let mut next = current.clone();
        next.insert(id.to_string(), recording);
        self.commit(&mut current, next)?;
        append_run_log(
            "debug",
            "recording_store.play_tracked",
            json!({ "id": id, "play_count": play_count }),
        );
        Ok(true)
    }

    pub fn export(&self, id: &str, path: &Path) -> StoreResult<bool> {
        let Some(recording) = self.get(id) else {
            return Ok(false);
        };
        let body = serde_json::to_string_pretty(&recording)
            .map_err(|e| SequencerError::Io(e.to_string()))?;
        self.fs.write_string(path, &body)?;
        append_run_log(
            "info",
            "recording_store.exported",
            json!({ "id": id, "path": path.display().to_string() }),
        );
        Ok(true)
    }

    /// Import a standalone recording file under a fresh id. The source's id,
    /// timestamps and play count are discarded.
    pub fn import(&self, path: &Path) -> StoreResult<String> {
        let raw = self.fs.read_to_string(path)?;
        let imported: ImportedRecording = serde_json::from_str(&raw).map_err(|e| {
            append_run_log(
                "warn",
                "recording_store.import_rejected",
                json!({ "path": path.display().to_string(), "error": e.to_string() }),
            );
            SequencerError::MalformedRecording(format!("{}: {e}", path.display()))
        })?;
        let commands = imported
            .commands
            .into_iter()
            .map(CommandInput::from)
            .collect::<Vec<_>>();
        let id = self.create(
            &imported.name,
            commands,
            &imported.description,
            imported.start_directory,
        )?;
        append_run_log(
            "info",
            "recording_store.imported",
            json!({ "id": id, "path": path.display().to_string() }),
        );
        Ok(id)
    }
}

fn parse_store(raw: &str) -> StoreResult<RecordingMap> {
    if raw.trim().is_empty() {
        return Ok(RecordingMap::new());
    }
    let mut map: RecordingMap =
        serde_json::from_str(raw).map_err(|e| SequencerError::StoreParse(e.to_string()))?;
    for (key, recording) in map.iter_mut() {
        if recording.id.is_empty() {
            recording.id = key.clone();
        }
    }
    Ok(map)
}

fn unique_id(existing: &RecordingMap, created_at: NaiveDateTime) -> String {
    let base = recording_id_for(created_at);
    if !existing.contains_key(&base) {
        return base;
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{base}_{suffix}");
        if !existing.contains_key(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}
