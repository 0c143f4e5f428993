//! Injective two-way map, used to associate peer node ids with live
//! connection ids. Both directions are kept in sync by the single owner;
//! inserting a pair evicts any previous binding of either key.
use std::collections::HashMap;
use std::hash::Hash;

pub struct Bimap<A, B> {
	fwd: HashMap<A, B>,
	rev: HashMap<B, A>,
}

impl<A, B> Bimap<A, B>
where
	A: Clone + Eq + Hash,
	B: Clone + Eq + Hash,
{
	pub fn new() -> Self {
		Self {
			fwd: HashMap::new(),
			rev: HashMap::new(),
		}
	}

	pub fn insert(&mut self, a: A, b: B) {
		if let Some(old_b) = self.fwd.remove(&a) {
			self.rev.remove(&old_b);
		}
		if let Some(old_a) = self.rev.remove(&b) {
			self.fwd.remove(&old_a);
		}
		self.fwd.insert(a.clone(), b.clone());
		self.rev.insert(b, a);
	}

	pub fn get_by_left(&self, a: &A) -> Option<&B> {
		self.fwd.get(a)
	}

	pub fn get_by_right(&self, b: &B) -> Option<&A> {
		self.rev.get(b)
	}

	pub fn remove_by_right(&mut self, b: &B) -> Option<A> {
		let a = self.rev.remove(b)?;
		self.fwd.remove(&a);
		Some(a)
	}
}

impl<A, B> Default for Bimap<A, B>
where
	A: Clone + Eq + Hash,
	B: Clone + Eq + Hash,
{
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_insert_and_lookup() {
		let mut m = Bimap::new();
		m.insert("n1", 1u64);
		m.insert("n2", 2u64);
		assert_eq!(m.get_by_left(&"n1"), Some(&1));
		assert_eq!(m.get_by_right(&2), Some(&"n2"));
	}

	#[test]
	fn test_insert_replaces_both_directions() {
		let mut m = Bimap::new();
		m.insert("n1", 1u64);
		// Same node reconnects on a new conn id
		m.insert("n1", 2u64);
		assert_eq!(m.get_by_left(&"n1"), Some(&2));
		assert_eq!(m.get_by_right(&1), None);

		// A new node takes over an existing conn id
		m.insert("n2", 2u64);
		assert_eq!(m.get_by_right(&2), Some(&"n2"));
		assert_eq!(m.get_by_left(&"n1"), None);
	}

	#[test]
	fn test_remove_by_right() {
		let mut m = Bimap::new();
		m.insert("n1", 1u64);
		assert_eq!(m.remove_by_right(&1), Some("n1"));
		assert_eq!(m.get_by_left(&"n1"), None);
		assert_eq!(m.remove_by_right(&1), None);
	}
}
