//! Change detection: digests, rerun policy and stale-file cleanup.
//!
//! Every record contributes to a digest of its run key (code or console) or,
//! for custom code, of its family's hook digest. Typeset records also get a
//! digest of their own. Comparing these with the previous snapshot decides
//! which sessions execute and which highlighted renderings are rebuilt.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use rustc_hash::FxHashMap;

use crate::engine::EngineRegistry;
use crate::error::{Error, Result};
use crate::hash::{DigestAccumulator, HashTriple, empty_digest, file_digest};
use crate::paths::JobPaths;
use crate::record::CodeRecord;
use crate::report::Diagnostics;
use crate::settings::{HighlightConfig, RerunMode};
use crate::state::{DepStamp, ExitStatus, RunState};

/// Digests of the current document.
#[derive(Debug, Clone, Default)]
pub struct Digests {
    pub code: BTreeMap<String, HashTriple>,
    pub cons: BTreeMap<String, HashTriple>,
    pub typeset: BTreeMap<String, String>,
}

/// Compute run, custom-code and typeset digests for every record.
pub fn compute_digests(records: &[CodeRecord], engines: &EngineRegistry) -> Result<Digests> {
    let mut code: BTreeMap<String, DigestAccumulator> = BTreeMap::new();
    let mut cons: BTreeMap<String, DigestAccumulator> = BTreeMap::new();
    let mut custom: FxHashMap<String, DigestAccumulator> = FxHashMap::default();
    let mut typeset: BTreeMap<String, DigestAccumulator> = BTreeMap::new();

    for rec in records {
        let target = if rec.is_code {
            Some(code.entry(rec.run_id()).or_default())
        } else if rec.is_cons {
            Some(cons.entry(rec.run_id()).or_default())
        } else if let Some(cc_type) = rec.cc_type() {
            let acc = custom.entry(cc_type.to_string()).or_default();
            acc.update(rec.hashable_delims());
            acc.update(&rec.code);
            continue;
        } else {
            None
        };
        if let Some(acc) = target {
            acc.update(rec.hashable_delims());
            acc.update(&rec.code);
        }
        if rec.is_typeset {
            let acc = typeset.entry(rec.typeset_id().to_string()).or_default();
            acc.update(rec.hashable_delims());
            acc.update(&rec.code);
            acc.update(&rec.args_prettyprint);
        }
    }

    let empty = empty_digest();
    let triple = |key: &str, acc: &DigestAccumulator| -> Result<HashTriple> {
        let family = key.split('#').next().unwrap_or_default();
        let engine = engines
            .get(family)
            .ok_or_else(|| Error::UnknownFamily(family.to_string()))?;
        Ok(HashTriple {
            code: acc.finish(),
            custom: custom.get(family).map(|c| c.finish()).unwrap_or_else(|| empty.clone()),
            engine: engine.engine_hash(),
        })
    };

    Ok(Digests {
        code: code
            .iter()
            .map(|(k, acc)| Ok((k.clone(), triple(k, acc)?)))
            .collect::<Result<_>>()?,
        cons: cons
            .iter()
            .map(|(k, acc)| Ok((k.clone(), triple(k, acc)?)))
            .collect::<Result<_>>()?,
        typeset: typeset.iter().map(|(k, acc)| (k.clone(), acc.finish())).collect(),
    })
}

/// Modification time of a file in seconds since the epoch.
pub fn file_mtime(path: &Path) -> Option<f64> {
    let modified = path.metadata().ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs_f64())
}

/// Stamp a dependency that exists on disk.
pub fn stamp_dependency(path: &Path, hash_dependencies: bool) -> Option<DepStamp> {
    let mtime = file_mtime(path)?;
    let hash = if hash_dependencies {
        file_digest(path).ok()?
    } else {
        String::new()
    };
    Some(DepStamp { mtime: Some(mtime), hash: Some(hash) })
}

/// Report a dependency that cannot be found.
pub fn missing_dependency(diags: &mut Diagnostics, dep: &str, label: &str) {
    diags.error([
        format!("Cannot find dependency \"{}\"", dep),
        format!("It belongs to {}", label),
        "Relative paths to dependencies must be specified from the working directory.".to_string(),
    ]);
}

/// Stamp a dependency reported by a unit, resolving it against the
/// working directory. A missing file is reported and gets a null stamp.
pub fn record_dependency(
    paths: &JobPaths,
    dep: &str,
    hash_dependencies: bool,
    diags: &mut Diagnostics,
    label: &str,
) -> DepStamp {
    let path = paths.resolve_dependency(dep);
    match stamp_dependency(&path, hash_dependencies).filter(|_| path.is_file()) {
        Some(stamp) => stamp,
        None => {
            missing_dependency(diags, dep, label);
            DepStamp::unresolved()
        }
    }
}

/// Which units need work this run. `true` means execute or re-highlight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    pub code: BTreeMap<String, bool>,
    pub cons: BTreeMap<String, bool>,
    pub typeset: BTreeMap<String, bool>,
}

impl UpdatePlan {
    pub fn needs_update(&self, run_id: &str) -> bool {
        self.code.get(run_id).or_else(|| self.cons.get(run_id)).copied().unwrap_or(false)
    }

    pub fn typeset_update(&self, typeset_id: &str) -> bool {
        self.typeset.get(typeset_id).copied().unwrap_or(false)
    }

    pub fn updated_count(&self) -> usize {
        self.code.values().chain(self.cons.values()).filter(|u| **u).count()
    }
}

/// Compares the current digests against the previous snapshot.
pub struct ChangeDetector<'a> {
    pub paths: &'a JobPaths,
    pub rerun: RerunMode,
    pub hash_dependencies: bool,
}

impl ChangeDetector<'_> {
    /// Whether any recorded dependency of `key` changed since `old` was saved.
    ///
    /// A dependency that no longer exists is reported as an error but does
    /// not by itself trigger a re-run.
    pub fn modified_dependencies(&self, key: &str, old: &RunState, diags: &mut Diagnostics) -> bool {
        let Some(deps) = old.dependencies.get(key) else {
            return false;
        };
        let mut names: Vec<&String> = deps.keys().collect();
        names.sort();
        for dep in names {
            let path = self.paths.resolve_dependency(dep);
            if !path.is_file() {
                missing_dependency(diags, dep, &key.replace('#', ":"));
                continue;
            }
            let stamp = &deps[dep];
            if self.hash_dependencies {
                match file_digest(&path) {
                    Ok(h) if Some(&h) == stamp.hash.as_ref() => {}
                    _ => return true,
                }
            } else if file_mtime(&path) != stamp.mtime {
                return true;
            }
        }
        false
    }

    /// Apply the rerun policy to one key that exists in the old snapshot.
    pub fn should_rerun(
        &self,
        key: &str,
        new: &HashTriple,
        old_hash: &HashTriple,
        old_status: ExitStatus,
        old: &RunState,
        diags: &mut Diagnostics,
    ) -> bool {
        let mut changed = || new != old_hash || self.modified_dependencies(key, old, diags);
        match self.rerun {
            RerunMode::Never => {
                if changed() {
                    diags.warning([
                        format!("Session {} has rerun=never", key.replace('#', ":")),
                        "But its code or dependencies have been modified".to_string(),
                    ]);
                }
                false
            }
            RerunMode::Modified => changed(),
            RerunMode::Errors => changed() || old_status.errors != 0,
            RerunMode::Warnings => changed() || !old_status.is_clean(),
            RerunMode::Always => true,
        }
    }

    /// Decide what to update and carry reusable results into `current`.
    ///
    /// `current` must already carry this run's digests and vitals. Files of
    /// every superseded or vanished key are deleted from disk here, before
    /// any new output is written.
    pub fn plan(
        &self,
        digests: &Digests,
        highlight: &BTreeMap<String, HighlightConfig>,
        old: Option<&RunState>,
        current: &mut RunState,
        diags: &mut Diagnostics,
    ) -> UpdatePlan {
        let mut plan = UpdatePlan::default();

        let code_reusable = old.filter(|o| o.code_vitals == current.code_vitals);
        for (key, hash) in &digests.code {
            let reuse = code_reusable.is_some_and(|o| {
                o.code_hashes.get(key).is_some_and(|old_hash| {
                    let status = o.exit_status.get(key).copied().unwrap_or_default();
                    !self.should_rerun(key, hash, old_hash, status, o, diags)
                })
            });
            if let (true, Some(o)) = (reuse, code_reusable) {
                carry_run_key(key, o, current);
                if self.unresolve_missing(key, current) {
                    current.code_hashes.insert(key.clone(), HashTriple::default());
                }
            }
            plan.code.insert(key.clone(), !reuse);
        }

        let cons_reusable = old.filter(|o| o.cons_vitals == current.cons_vitals);
        for (key, hash) in &digests.cons {
            let reuse = cons_reusable.is_some_and(|o| {
                o.cons_hashes.get(key).is_some_and(|old_hash| {
                    let status = o.exit_status.get(key).copied().unwrap_or_default();
                    !self.should_rerun(key, hash, old_hash, status, o, diags)
                })
            });
            if let (true, Some(o)) = (reuse, cons_reusable) {
                carry_run_key(key, o, current);
                if self.unresolve_missing(key, current) {
                    current.cons_hashes.insert(key.clone(), HashTriple::default());
                }
                if let Some(cache) = o.typeset_cache.get(key) {
                    current.typeset_cache.insert(key.clone(), cache.clone());
                }
            }
            plan.cons.insert(key.clone(), !reuse);
        }

        for (key, hash) in &digests.typeset {
            let family = key.split('#').next().unwrap_or_default();
            let Some(config) = highlight.get(family) else {
                plan.typeset.insert(key.clone(), false);
                continue;
            };
            let reuse = old.is_some_and(|o| {
                o.highlight_settings.get(family) == Some(&config.fingerprint())
                    && o.typeset_hashes.get(key) == Some(hash)
                    && !self.modified_dependencies(key, o, diags)
            });
            if let (true, Some(o)) = (reuse, old) {
                if let Some(m) = o.pygments_macros.get(key) {
                    current.pygments_macros.insert(key.clone(), m.clone());
                }
                if let Some(f) = o.pygments_files.get(key) {
                    current.pygments_files.insert(key.clone(), f.clone());
                }
                if let Some(d) = o.dependencies.get(key) {
                    current.dependencies.insert(key.clone(), d.clone());
                }
            }
            plan.typeset.insert(key.clone(), !reuse);
        }

        if let Some(o) = old {
            self.remove_stale(&plan, o);
        }

        tracing::debug!(
            "update plan: {} of {} code, {} of {} console, {} of {} typeset",
            plan.code.values().filter(|u| **u).count(),
            plan.code.len(),
            plan.cons.values().filter(|u| **u).count(),
            plan.cons.len(),
            plan.typeset.values().filter(|u| **u).count(),
            plan.typeset.len()
        );
        plan
    }

    /// Null the stamps of carried dependencies that no longer exist.
    ///
    /// Returns whether any were missing; the caller then stores a stale
    /// digest so the key re-runs on the next pass.
    fn unresolve_missing(&self, key: &str, current: &mut RunState) -> bool {
        let Some(deps) = current.dependencies.get_mut(key) else {
            return false;
        };
        let mut missing = false;
        for (dep, stamp) in deps.iter_mut() {
            if !self.paths.resolve_dependency(dep).is_file() {
                *stamp = DepStamp::unresolved();
                missing = true;
            }
        }
        missing
    }

    fn remove_stale(&self, plan: &UpdatePlan, old: &RunState) {
        let superseded = |update: &BTreeMap<String, bool>, old_hashes: Vec<&String>| {
            let mut keys: Vec<String> = update.iter().filter(|(_, u)| **u).map(|(k, _)| k.clone()).collect();
            keys.extend(old_hashes.into_iter().filter(|k| !update.contains_key(*k)).cloned());
            keys
        };

        let mut stale = superseded(&plan.code, old.code_hashes.keys().collect());
        stale.extend(superseded(&plan.cons, old.cons_hashes.keys().collect()));
        for key in stale {
            if let Some(files) = old.files.get(&key) {
                tracing::debug!("removing {} stale files of {}", files.len(), key);
                self.paths.remove_recorded(files);
            }
        }

        for (key, files) in &old.pygments_files {
            if plan.typeset.get(key).copied().unwrap_or(true) {
                self.paths.remove_recorded(files);
            }
        }
    }
}

fn carry_run_key(key: &str, old: &RunState, current: &mut RunState) {
    if let Some(m) = old.macros.get(key) {
        current.macros.insert(key.to_string(), m.clone());
    }
    if let Some(f) = old.files.get(key) {
        current.files.insert(key.to_string(), f.clone());
    }
    if let Some(d) = old.dependencies.get(key) {
        current.dependencies.insert(key.to_string(), d.clone());
    }
    if let Some(s) = old.exit_status.get(key) {
        current.exit_status.insert(key.to_string(), *s);
    }
}
