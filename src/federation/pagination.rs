// SPDX-License-Identifier: Apache-2.0

//! Window pagination through primary-key probing.
//!
//! The final row count of a federated query is only known after joining, so
//! an offset/limit cannot be pushed into any single source. Instead the
//! transformer runs the query once projected to the base range's primary
//! key, slices the ordered distinct keys to the requested page and restricts
//! the real query to those keys with an `IN` condition.

use std::time::Instant;

use tracing::{debug, instrument, warn};

use crate::engine::error::ExecutionResult;
use crate::engine::traits::EntityMetadata;
use crate::engine::types::{ResultSet, Value};
use crate::metrics;
use crate::query::ast::{
    Expr, ExprKind, QueryPlan, RangeSource, SelectItem, IN_VALUES_ARE_FINAL,
};

use super::types::PaginationOutcome;

/// Output column carrying the probed primary key.
pub const PROBE_KEY_ALIAS: &str = "__pk";

/// Rewrites a windowed plan so that it returns a single page.
pub struct PaginationTransformer<'m> {
    metadata: &'m dyn EntityMetadata,
}

/// Plan fields the probe overrides, restored when the guard drops
struct ScopedProbe<'a> {
    plan: &'a mut QueryPlan,
    values: Vec<SelectItem>,
    unique: bool,
    window: Option<u64>,
    window_size: Option<u64>,
}

impl<'a> ScopedProbe<'a> {
    fn new(plan: &'a mut QueryPlan, key: SelectItem) -> Self {
        let values = std::mem::replace(&mut plan.values, vec![key]);
        let unique = std::mem::replace(&mut plan.unique, true);
        let window = plan.window.take();
        let window_size = plan.window_size.take();
        Self {
            plan,
            values,
            unique,
            window,
            window_size,
        }
    }

    fn plan(&mut self) -> &mut QueryPlan {
        self.plan
    }
}

impl Drop for ScopedProbe<'_> {
    fn drop(&mut self) {
        self.plan.values = std::mem::take(&mut self.values);
        self.plan.unique = self.unique;
        self.plan.window = self.window;
        self.plan.window_size = self.window_size;
    }
}

impl<'m> PaginationTransformer<'m> {
    pub fn new(metadata: &'m dyn EntityMetadata) -> Self {
        Self { metadata }
    }

    /// Applies the plan's window natively when possible.
    ///
    /// `probe` executes a plan without pagination; it is called at most once,
    /// with the plan temporarily projected to the primary key. When the
    /// returned outcome is not native the plan is left unchanged and the
    /// caller is expected to window the full result itself.
    #[instrument(skip_all, fields(window = ?plan.window, window_size = ?plan.window_size))]
    pub fn apply<F>(&self, plan: &mut QueryPlan, probe: F) -> ExecutionResult<PaginationOutcome>
    where
        F: FnOnce(&mut QueryPlan) -> ExecutionResult<ResultSet>,
    {
        let Some(window) = plan.window else {
            return Ok(PaginationOutcome::NotRequested);
        };
        if plan.sort.as_ref().is_some_and(|s| s.in_application) {
            return Ok(skipped("sorting is applied by the application"));
        }
        let Some(size) = plan.window_size else {
            return Ok(skipped("no window size"));
        };
        if plan.has_aggregates() {
            return Ok(skipped("aggregated result"));
        }
        let (base, pk) = match self.primary_key(plan) {
            Ok(found) => found,
            Err(reason) => return Ok(skipped(reason)),
        };

        let start = usize::try_from(window.saturating_mul(size)).unwrap_or(usize::MAX);
        let len = usize::try_from(size).unwrap_or(usize::MAX);

        if plan.has_directive(IN_VALUES_ARE_FINAL) {
            // A bound list parameter holds many keys behind one node, so only
            // all-literal lists can be sliced item by item.
            let sliced = match find_pk_in(plan.conditions.as_mut(), &base, &pk) {
                Some(Expr {
                    kind: ExprKind::In { list, .. },
                    ..
                }) if list.iter().all(|item| matches!(item.kind, ExprKind::Literal(_))) => {
                    *list = slice(std::mem::take(list), start, len);
                    Some(list.len())
                }
                _ => None,
            };
            if let Some(page_keys) = sliced {
                if page_keys == 0 {
                    plan.and_condition(Expr::always_false());
                }
                debug!(page_keys, "sliced final IN values");
                return Ok(PaginationOutcome::InValuesSliced { page_keys });
            }
        }

        let probe_start = Instant::now();
        let keys = {
            let mut scoped = ScopedProbe::new(
                plan,
                SelectItem::aliased(Expr::ident(&base, &pk), PROBE_KEY_ALIAS),
            );
            probe(scoped.plan())
                .map_err(|e| e.context("probing primary keys for pagination"))?
        };
        metrics::record_pagination_probe();

        let keys: Vec<Value> = keys
            .into_iter()
            .filter_map(|row| row.get(PROBE_KEY_ALIAS).cloned())
            .collect();
        let total_keys = keys.len();
        let page: Vec<Expr> = slice(keys, start, len).into_iter().map(Expr::lit).collect();
        debug!(
            total_keys,
            page_keys = page.len(),
            probe_ms = probe_start.elapsed().as_secs_f64() * 1000.0,
            "primary keys probed"
        );

        if page.is_empty() {
            plan.and_condition(Expr::always_false());
            return Ok(PaginationOutcome::EmptyPage { total_keys });
        }

        let page_keys = page.len();
        let page = match find_pk_in(plan.conditions.as_mut(), &base, &pk) {
            Some(Expr {
                kind: ExprKind::In { list, .. },
                ..
            }) => {
                *list = page;
                None
            }
            _ => Some(page),
        };
        if let Some(page) = page {
            plan.and_condition(Expr::in_list(Expr::ident(&base, &pk), page));
        }
        Ok(PaginationOutcome::KeysProbed {
            total_keys,
            page_keys,
        })
    }

    /// Resolves the base range and its single-column primary key.
    fn primary_key(&self, plan: &QueryPlan) -> Result<(String, String), String> {
        let base = plan
            .base_range()
            .ok_or_else(|| "query has no base range".to_string())?;
        let RangeSource::Entity { entity } = &base.source else {
            return Err(format!("base range '{}' is a JSON document", base.name));
        };
        if self.metadata.is_view(entity) {
            return Err(format!("entity '{entity}' is a view"));
        }
        let mut pk = self.metadata.primary_key(entity);
        match pk.len() {
            1 => Ok((base.name.clone(), pk.remove(0))),
            0 => Err(format!("entity '{entity}' has no primary key")),
            n => Err(format!("entity '{entity}' has a composite primary key of {n} columns")),
        }
    }
}

fn skipped(reason: impl Into<String>) -> PaginationOutcome {
    let reason = reason.into();
    warn!(%reason, "pagination skipped, windowing in memory");
    metrics::record_pagination_skipped();
    PaginationOutcome::Skipped { reason }
}

fn slice<T>(items: Vec<T>, start: usize, len: usize) -> Vec<T> {
    items.into_iter().skip(start).take(len).collect()
}

/// Finds a non-negated `IN` on `range.pk` among the AND-conjuncts of `expr`.
fn find_pk_in<'e>(expr: Option<&'e mut Expr>, range: &str, pk: &str) -> Option<&'e mut Expr> {
    let expr = expr?;
    let is_pk_in = match &expr.kind {
        ExprKind::In { expr: target, negated: false, .. } => target
            .as_identifier()
            .is_some_and(|ident| ident.range == range && ident.is_base() && ident.path[0] == pk),
        _ => false,
    };
    if is_pk_in {
        return Some(expr);
    }
    match &mut expr.kind {
        ExprKind::And(left, right) => {
            find_pk_in(Some(left.as_mut()), range, pk)
                .or_else(|| find_pk_in(Some(right.as_mut()), range, pk))
        }
        _ => None,
    }
}
