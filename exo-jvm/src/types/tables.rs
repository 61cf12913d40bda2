//! Instanceof and interface-method hash tables (§4.2).

use std::sync::Arc;

use fnv::FnvHashMap;

use super::method::MethodId;
use super::{Method, Type};

const INSTANCEOF_HASHSIZE: usize = 64;
const IMETHOD_HASHSIZE: usize = 32;

/// Union of `this`, every supertype, and every implemented interface,
/// bucketed by a hash of the type's identity (its name, since types are
/// unique per defining loader).
#[derive(Debug, Default)]
pub struct InstanceofTable {
    buckets: Vec<Vec<super::TypeName>>,
}

impl InstanceofTable {
    pub fn build(
        this_name: &super::TypeName,
        superclass: Option<&Type>,
        interfaces: &[Arc<Type>],
    ) -> Self {
        let mut buckets = vec![Vec::new(); INSTANCEOF_HASHSIZE];
        let mut seen = std::collections::HashSet::new();

        let mut insert = |name: super::TypeName| {
            if seen.insert(name.clone()) {
                let bucket = Self::bucket_for(&name);
                buckets[bucket].push(name);
            }
        };

        insert(this_name.clone());
        let mut cur = superclass;
        while let Some(t) = cur {
            insert(t.name.clone());
            for iface in &t.interfaces {
                insert(iface.name.clone());
                for super_iface in iface.instanceof.iter() {
                    insert(super_iface.clone());
                }
            }
            cur = t.superclass.as_deref();
        }
        for iface in interfaces {
            insert(iface.name.clone());
            for super_iface in iface.instanceof.iter() {
                insert(super_iface.clone());
            }
        }

        Self { buckets }
    }

    fn bucket_for(name: &super::TypeName) -> usize {
        use std::hash::{Hash, Hasher};
        let mut h = fnv::FnvHasher::default();
        name.hash(&mut h);
        (h.finish() as usize) % INSTANCEOF_HASHSIZE
    }

    pub fn contains(&self, other: &Type) -> bool {
        let bucket = Self::bucket_for(&other.name);
        self.buckets[bucket].iter().any(|n| *n == other.name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &super::TypeName> {
        self.buckets.iter().flatten()
    }
}

/// Interface-method dispatch table: a bucketed hash table plus a parallel
/// "quick" direct-indexed table populated for buckets holding exactly one
/// method, per §4.2's `invokeinterface` fast path.
#[derive(Debug, Default)]
pub struct InterfaceMethodTable {
    buckets: Vec<Vec<Arc<Method>>>,
    /// `Some(method)` iff this bucket index holds exactly one method.
    quick: Vec<Option<Arc<Method>>>,
}

impl InterfaceMethodTable {
    pub fn build(resolved_methods: Vec<Arc<Method>>) -> Self {
        let mut buckets: Vec<Vec<Arc<Method>>> = vec![Vec::new(); IMETHOD_HASHSIZE];
        for m in resolved_methods {
            let bucket = (m.signature_hash as usize) % IMETHOD_HASHSIZE;
            buckets[bucket].push(m);
        }
        let quick = buckets
            .iter()
            .map(|b| if b.len() == 1 { Some(b[0].clone()) } else { None })
            .collect();
        Self { buckets, quick }
    }

    /// Looks up the resolution of `name`/`descriptor` as declared by some
    /// interface this class implements. Returns `None` on a miss (caller
    /// raises `AbstractMethodError`).
    pub fn lookup(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        let hash = Method::signature_hash_of(name, descriptor);
        let bucket = (hash as usize) % IMETHOD_HASHSIZE;

        if let Some(quick) = &self.quick[bucket] {
            if quick.signature_hash == hash {
                return Some(quick.clone());
            }
        }
        self.buckets[bucket]
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
            .cloned()
    }

    pub fn method_ids(&self) -> impl Iterator<Item = &Arc<Method>> {
        self.buckets.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quick_table_only_set_for_singleton_buckets() {
        let methods = vec![];
        let table = InterfaceMethodTable::build(methods);
        assert!(table.quick.iter().all(|q| q.is_none()));
    }
}
