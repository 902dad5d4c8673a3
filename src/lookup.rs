//! Lookup tables over instance descriptors.
//!
//! A table is built fresh for every operation and indexes descriptors by id,
//! tag, tag value and IP address. Local and remote descriptors are always
//! kept in separate tables and combined in a [`Catalog`].

use crate::core::{Endpoint, Instance, InstanceRecord, RemoteInstance};
use crate::errors::{FwError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::debug;

/// An immutable index over one kind of descriptor.
#[derive(Debug, Clone)]
pub struct LookupTable<T> {
    by_id: BTreeMap<String, T>,
    by_tag: BTreeMap<String, BTreeSet<String>>,
    by_tag_value: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    by_ip: BTreeMap<IpAddr, BTreeSet<String>>,
}

impl<T> Default for LookupTable<T> {
    fn default() -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_tag: BTreeMap::new(),
            by_tag_value: BTreeMap::new(),
            by_ip: BTreeMap::new(),
        }
    }
}

impl<T: Endpoint> LookupTable<T> {
    /// Indexes `items`. Duplicate ids are reported and the later descriptor
    /// is skipped; every other descriptor is still indexed.
    pub fn build(items: impl IntoIterator<Item = T>) -> (Self, Vec<FwError>) {
        let mut table = Self::default();
        let mut errs = Vec::new();

        for item in items {
            let id = item.id().to_string();
            if table.by_id.contains_key(&id) {
                errs.push(FwError::validation(format!("duplicate instance id \"{}\"", id)));
                continue;
            }
            for (name, value) in item.tags() {
                table.by_tag.entry(name.clone()).or_default().insert(id.clone());
                table
                    .by_tag_value
                    .entry(name.clone())
                    .or_default()
                    .entry(value.key())
                    .or_default()
                    .insert(id.clone());
            }
            for ip in item.ips() {
                table.by_ip.entry(*ip).or_default().insert(id.clone());
            }
            table.by_id.insert(id, item);
        }

        debug!(entries = table.by_id.len(), errors = errs.len(), "Built lookup table");
        (table, errs)
    }

    /// Validates raw records and indexes the valid ones. Per-record
    /// validation errors are returned alongside the table.
    pub fn from_records(records: impl IntoIterator<Item = InstanceRecord>) -> (Self, Vec<FwError>)
    where
        T: TryFrom<InstanceRecord, Error = FwError>,
    {
        let mut errs = Vec::new();
        let valid: Vec<T> = records
            .into_iter()
            .filter_map(|record| match T::try_from(record) {
                Ok(item) => Some(item),
                Err(e) => {
                    errs.push(e);
                    None
                }
            })
            .collect();
        let (table, build_errs) = Self::build(valid);
        errs.extend(build_errs);
        (table, errs)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Every descriptor, ordered by id.
    pub fn all(&self) -> impl Iterator<Item = &T> {
        self.by_id.values()
    }

    pub fn with_tag<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a T> + 'a {
        self.resolve_ids(self.by_tag.get(name))
    }

    pub fn with_tag_value<'a>(
        &'a self,
        name: &str,
        value: &str,
    ) -> impl Iterator<Item = &'a T> + 'a {
        self.resolve_ids(self.by_tag_value.get(name).and_then(|values| values.get(value)))
    }

    pub fn with_ip(&self, ip: &IpAddr) -> impl Iterator<Item = &T> {
        self.resolve_ids(self.by_ip.get(ip))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn resolve_ids<'a>(
        &'a self,
        ids: Option<&'a BTreeSet<String>>,
    ) -> impl Iterator<Item = &'a T> + 'a {
        ids.into_iter()
            .flatten()
            .filter_map(move |id| self.by_id.get(id))
    }
}

/// Local and remote lookup tables visible to one operation.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub local: LookupTable<Instance>,
    pub remote: LookupTable<RemoteInstance>,
}

impl Catalog {
    /// Combines the two tables, rejecting any remote descriptor whose id is
    /// also a local instance id.
    pub fn new(local: LookupTable<Instance>, remote: LookupTable<RemoteInstance>) -> Result<Self> {
        FwError::check(collisions(&local, remote.all()))?;
        Ok(Self { local, remote })
    }

    /// Builds both tables from raw records, aggregating every validation
    /// failure.
    pub fn from_records(
        local: Vec<InstanceRecord>,
        remote: Vec<RemoteInstance>,
    ) -> Result<Self> {
        let (local, mut errs) = LookupTable::<Instance>::from_records(local);
        let (remote, remote_errs) = LookupTable::build(remote);
        errs.extend(remote_errs);
        errs.extend(collisions(&local, remote.all()));
        FwError::check(errs)?;
        Ok(Self { local, remote })
    }
}

/// Remote descriptors that share an id with a local instance.
pub fn collisions<'a>(
    local: &LookupTable<Instance>,
    remote: impl IntoIterator<Item = &'a RemoteInstance>,
) -> Vec<FwError> {
    remote
        .into_iter()
        .filter(|r| local.contains(&r.id))
        .map(|r| {
            FwError::validation(format!(
                "remote instance \"{}\" has the same id as a local instance",
                r.id
            ))
        })
        .collect()
}
