use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Loads and saves one serializable value as a JSON file. Saves go
/// through a temporary file followed by a rename, so a crash leaves
/// either the old or the new value intact, never a torn one.
pub struct Persister<T: Serialize + for<'de> Deserialize<'de>> {
	path: PathBuf,
	tmp_path: PathBuf,

	_marker: std::marker::PhantomData<T>,
}

impl<T> Persister<T>
where
	T: Serialize + for<'de> Deserialize<'de>,
{
	pub fn new(base_dir: &Path, file_name: &str) -> Self {
		let path = base_dir.join(file_name);
		let tmp_path = base_dir.join(format!("{}.tmp", file_name));
		Self {
			path,
			tmp_path,
			_marker: Default::default(),
		}
	}

	pub fn load(&self) -> Result<T, Error> {
		let mut file = std::fs::OpenOptions::new().read(true).open(&self.path)?;

		let mut bytes = vec![];
		file.read_to_end(&mut bytes)?;

		let value = serde_json::from_slice(&bytes[..])?;
		Ok(value)
	}

	pub fn save(&self, t: &T) -> Result<(), Error> {
		let bytes = serde_json::to_vec(t)?;

		let mut file = std::fs::OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&self.tmp_path)?;
		file.write_all(&bytes[..])?;
		file.sync_all()?;
		drop(file);

		std::fs::rename(&self.tmp_path, &self.path)?;

		Ok(())
	}
}

#[cfg(test)]
mod test {
	use std::collections::HashMap;

	use super::*;
	use crate::data::NodeId;

	#[test]
	fn test_save_load_roundtrip() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let persister: Persister<HashMap<NodeId, String>> =
			Persister::new(dir.as_path(), "cluster.json");

		let mut map = HashMap::new();
		map.insert(NodeId::new("node-a"), "127.0.0.1:9000".to_string());
		map.insert(NodeId::new("node-b"), "127.0.0.1:9001".to_string());

		persister.save(&map).unwrap();
		let loaded = persister.load().unwrap();
		assert_eq!(loaded, map);
	}

	#[test]
	fn test_load_missing_file_is_error() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let persister: Persister<Vec<String>> = Persister::new(dir.as_path(), "nope.json");
		assert!(persister.load().is_err());
	}

	#[test]
	fn test_save_overwrites_atomically() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let persister: Persister<Vec<String>> = Persister::new(dir.as_path(), "list.json");

		persister.save(&vec!["a".to_string()]).unwrap();
		persister.save(&vec!["a".to_string(), "b".to_string()]).unwrap();

		assert_eq!(persister.load().unwrap().len(), 2);
		assert!(!dir.as_path().join("list.json.tmp").exists());
	}
}
