use std::path::{Path, PathBuf};
use std::sync::{OnceLock, PoisonError, RwLock};

use regex::Regex;

use crate::catalog::{Preset, ProfileTemplate};
use crate::error::{Error, Result};
use crate::logger;

/// Source of action lists for run controllers.
pub trait ProfileSource: Send + Sync {
    fn load(&self, name: &str) -> Result<ProfileTemplate>;
}

/// JSON files under `profiles_dir/<sanitized name>.json` and
/// `presets_dir/<id>.json`. Writes exclude concurrent loads so a reload
/// never sees half a file.
pub struct ProfileStore {
    profiles_dir: PathBuf,
    presets_dir: PathBuf,
    lock: RwLock<()>,
}

/// Strip everything but word characters from a profile name.
pub fn sanitize_name(name: &str) -> String {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    let re = NON_WORD.get_or_init(|| Regex::new(r"\W").expect("static regex"));
    re.replace_all(name, "").into_owned()
}

impl ProfileStore {
    pub fn new(profiles_dir: impl Into<PathBuf>, presets_dir: impl Into<PathBuf>) -> Self {
        Self {
            profiles_dir: profiles_dir.into(),
            presets_dir: presets_dir.into(),
            lock: RwLock::new(()),
        }
    }

    fn profile_path(&self, name: &str) -> Result<PathBuf> {
        let file = sanitize_name(name);
        if file.is_empty() {
            return Err(Error::Profile { name: name.to_string(), reason: "empty name".into() });
        }
        Ok(self.profiles_dir.join(format!("{}.json", file)))
    }

    pub fn save(&self, template: &ProfileTemplate) -> Result<()> {
        let path = self.profile_path(&template.name)?;
        let json = serde_json::to_string_pretty(template)?;
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        std::fs::create_dir_all(&self.profiles_dir)?;
        std::fs::write(&path, json)?;
        logger::info(&format!("profile saved: {}", template.name));
        Ok(())
    }

    /// Stored profile names, sorted.
    pub fn list(&self) -> Vec<String> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let mut names = json_stems(&self.profiles_dir);
        names.sort();
        names
    }

    pub fn list_presets(&self) -> Result<Vec<Preset>> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let mut presets = Vec::new();
        for stem in json_stems(&self.presets_dir) {
            let raw = std::fs::read_to_string(self.presets_dir.join(format!("{}.json", stem)))?;
            presets.push(serde_json::from_str::<Preset>(&raw)?);
        }
        presets.sort_by_key(|p| p.id);
        Ok(presets)
    }

    pub fn save_preset(&self, id: u32, preset: &Preset) -> Result<()> {
        let mut preset = preset.clone();
        preset.id = id;
        let json = serde_json::to_string_pretty(&preset)?;
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        std::fs::create_dir_all(&self.presets_dir)?;
        std::fs::write(self.presets_dir.join(format!("{}.json", id)), json)?;
        Ok(())
    }
}

impl ProfileSource for ProfileStore {
    fn load(&self, name: &str) -> Result<ProfileTemplate> {
        let path = self.profile_path(name)?;
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let raw = std::fs::read_to_string(&path).map_err(|e| Error::Profile {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::Profile {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

fn json_stems(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ActionItem, ActionKind, ProfilePreset};

    fn store(dir: &Path) -> ProfileStore {
        ProfileStore::new(dir.join("profiles"), dir.join("preset"))
    }

    fn template(name: &str) -> ProfileTemplate {
        ProfileTemplate {
            name: name.to_string(),
            items: vec![ProfilePreset {
                preset: Preset {
                    id: 1,
                    name: "fight".into(),
                    items: vec![ActionItem::new(ActionKind::Attack, "1")],
                },
                is_active: true,
            }],
        }
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_name("my profile/../x!"), "myprofilex");
        assert_eq!(sanitize_name("Spoil_2"), "Spoil_2");
    }

    #[test]
    fn save_load_list() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.save(&template("farm cave")).unwrap();
        s.save(&template("buffer")).unwrap();

        assert_eq!(s.list(), vec!["buffer".to_string(), "farmcave".to_string()]);
        let loaded = s.load("farm cave").unwrap();
        assert_eq!(loaded, template("farm cave"));
        assert_eq!(loaded.action_items().len(), 1);
    }

    #[test]
    fn load_errors_name_the_profile() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        match s.load("absent") {
            Err(Error::Profile { name, .. }) => assert_eq!(name, "absent"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(s.save(&template("!!!")).is_err());
    }

    #[test]
    fn presets_round_trip_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let p = Preset { id: 0, name: "heal".into(), items: vec![] };
        s.save_preset(3, &p).unwrap();
        s.save_preset(1, &p).unwrap();
        let ids: Vec<u32> = s.list_presets().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
