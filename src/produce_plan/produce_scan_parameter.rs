//! Shared machinery both reconstruction strategies build on: classifying
//! blocks into the measure/filter roles of spec.md §4.3, posting
//! cross-block attribute/filter requests (`RawRequest`), and lowering a
//! finalized request into the attribute/filter shape a scan needs
//! (`RawScanParameter`) before it is turned into a wire-ready
//! [`ScanParameter`].

use super::scan_parameter::ScanParameter;
use crate::errors::{PlanError, PlanResult};
use crate::expression::Expression;
use crate::metadata::{BlockMeta, Boundary, ComplexBoundary, Query, SetRelation};
use crate::registry::Registry;
use crate::schema::Schema;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Which side of a block's request a `request()` call is posting:
/// predicate evaluation or aggregate-measure evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Filter,
    Measure,
}

fn set_difference(a: &HashSet<String>, b: &HashSet<String>) -> HashSet<String> {
    a.difference(b).cloned().collect()
}

fn set_intersection(a: &HashSet<String>, b: &HashSet<String>) -> HashSet<String> {
    a.intersection(b).cloned().collect()
}

/// The blocks within `blocks` whose boundary+schema is not disjoint from
/// `{filter, attributes}` (spec.md §4.3's `filterBlocks`).
pub fn filter_blocks(
    blocks: &[BlockMeta],
    filter: &Boundary,
    attributes: &HashSet<String>,
    registry: &Registry,
) -> PlanResult<Vec<BlockMeta>> {
    let mut out = Vec::new();
    for b in blocks {
        if b.relationship(filter, attributes, registry)? != SetRelation::Disjoint {
            out.push(b.clone());
        }
    }
    Ok(out)
}

/// The extra boundary that must additionally hold for `source` to become
/// a subset of `target`: `source ∩ target`, with any per-attribute
/// interval that already equals `source`'s own dropped (it contributes
/// nothing new to converge on).
pub fn converge_boundary(source: &Boundary, target: &Boundary) -> PlanResult<Boundary> {
    let intersected = source.intersect(target)?;
    let mut kept = HashMap::new();
    for (attr, interval) in intersected.intervals() {
        let same = source
            .get(attr)
            .map(|s| s.relationship(interval).map(|r| r == SetRelation::Equal))
            .transpose()?
            .unwrap_or(false);
        if !same {
            kept.insert(attr.clone(), interval.clone());
        }
    }
    Ok(Boundary::new(kept))
}

/// The complex-boundary analogue: `target ∩ source`, dropping any
/// attribute whose resulting (still-disjoint) interval list is exactly
/// `source`'s single interval on that attribute.
pub fn converge_boundary_complex(
    source: &Boundary,
    target: &ComplexBoundary,
) -> PlanResult<ComplexBoundary> {
    let mut intersected = target.intersect(source)?;
    let mut keep = HashSet::new();
    for attr in intersected.attributes() {
        let ivs = intersected.get(&attr).unwrap_or(&[]);
        let same = match source.get(&attr) {
            None => false,
            Some(s) => ivs.len() == 1 && ivs[0].relationship(s)? == SetRelation::Equal,
        };
        if !same {
            keep.insert(attr);
        }
    }
    intersected.keep_attributes(&keep);
    Ok(intersected)
}

/// One block's accumulated cross-block requests while deriving scan
/// parameters for a single query: which attributes/filters other blocks
/// asked this block to serve, and which of the query's own predicates
/// this block already satisfies on its own.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub block: BlockMeta,
    pub query: Arc<Query>,
    pub filter_requested_attributes: HashSet<String>,
    pub measure_requested_attributes: HashSet<String>,
    pub filter_requested_filters: Vec<Boundary>,
    pub measure_requested_filters: Vec<Boundary>,
    pub passed_filter_attributes: HashSet<String>,
    pub extra_check_filter_attributes: HashSet<String>,
}

impl RawRequest {
    pub fn new(block: BlockMeta, query: Arc<Query>) -> Self {
        Self {
            block,
            query,
            filter_requested_attributes: HashSet::new(),
            measure_requested_attributes: HashSet::new(),
            filter_requested_filters: Vec::new(),
            measure_requested_filters: Vec::new(),
            passed_filter_attributes: HashSet::new(),
            extra_check_filter_attributes: HashSet::new(),
        }
    }

    fn add_attributes(&self, target: &mut HashSet<String>, attributes: &HashSet<String>) {
        let block_attrs = self.block.schema().attribute_names();
        target.extend(attributes.intersection(&block_attrs).cloned());
    }

    pub fn request(&mut self, attributes: &HashSet<String>, filter: Option<&Boundary>, kind: RequestKind) {
        match kind {
            RequestKind::Filter => {
                let mut target = std::mem::take(&mut self.filter_requested_attributes);
                self.add_attributes(&mut target, attributes);
                self.filter_requested_attributes = target;
                if let Some(f) = filter {
                    self.filter_requested_filters.push(f.clone());
                }
            }
            RequestKind::Measure => {
                let mut target = std::mem::take(&mut self.measure_requested_attributes);
                self.add_attributes(&mut target, attributes);
                self.measure_requested_attributes = target;
                if let Some(f) = filter {
                    self.measure_requested_filters.push(f.clone());
                }
            }
        }
    }

    pub fn intersect_filter(&mut self, b: &Boundary) -> PlanResult<()> {
        for f in &mut self.filter_requested_filters {
            *f = f.intersect(b)?;
        }
        for f in &mut self.measure_requested_filters {
            *f = f.intersect(b)?;
        }
        Ok(())
    }

    /// Drops requested/check attributes that turned out absent from this
    /// block, then clamps every requested filter to `block ∩ query`.
    pub fn finalize(&mut self) -> PlanResult<()> {
        let block_attrs = self.block.schema().attribute_names();
        self.filter_requested_attributes.retain(|a| block_attrs.contains(a));
        self.measure_requested_attributes.retain(|a| block_attrs.contains(a));
        self.extra_check_filter_attributes.retain(|a| block_attrs.contains(a));
        let clamp = self.block.boundary().intersect(self.query.filter_boundary())?;
        self.intersect_filter(&clamp)
    }
}

/// The shape a single block's scan needs before it is lowered into the
/// wire-ready [`ScanParameter`]: attribute sets keyed by name rather than
/// table-schema bit offset.
#[derive(Debug, Clone, Default)]
pub struct RawScanParameter {
    pub read_attributes: HashSet<String>,
    pub project_attributes: HashSet<String>,
    pub filters: ComplexBoundary,
    pub passed_attributes: HashSet<String>,
    pub direct_measures: Vec<bool>,
}

impl RawScanParameter {
    pub fn produce_scan_parameter(
        &self,
        table_schema: &Schema,
        sub_filters_in_query: &[Expression],
        block: &BlockMeta,
    ) -> PlanResult<ScanParameter> {
        let mut p = ScanParameter::new(
            block.partition_path().unwrap_or_default(),
            table_schema.len(),
            self.direct_measures.len(),
            sub_filters_in_query.len(),
        );
        for a in &self.read_attributes {
            p.read_attributes[table_schema.offset(a)?] = true;
        }
        for a in &self.project_attributes {
            p.project_attributes[table_schema.offset(a)?] = true;
        }
        p.direct_measures = self.direct_measures.clone();

        for (i, atom) in sub_filters_in_query.iter().enumerate() {
            let attrs = atom.attributes();
            if attrs.len() != 1 {
                return Err(PlanError::InvariantViolation(
                    "atomic query predicate must reference exactly one attribute".to_string(),
                ));
            }
            let a = attrs.iter().next().expect("checked len == 1");
            if self.passed_attributes.contains(a) {
                p.passed_preds[i] = true;
            }
        }

        if self.filters.attributes().is_empty() {
            p.filter = None;
            p.filter_boundary = None;
        } else {
            p.filter = Some(self.filters.make_expression());
            p.filter_boundary = Some(self.filters.clone());
        }

        p.block_ids = HashSet::from([block.block_id()]);
        p.blocks = vec![block.clone()];
        Ok(p)
    }
}

/// Posts `{attributes, filter}` as a request of `kind` onto every block in
/// `target_blocks`, creating a fresh `RawRequest` the first time a block is
/// touched.
pub fn post_requests_to(
    query: &Arc<Query>,
    target_blocks: &[BlockMeta],
    filter: Option<&Boundary>,
    attributes: &HashSet<String>,
    kind: RequestKind,
    requests: &mut HashMap<String, RawRequest>,
) {
    for b in target_blocks {
        let key = b.key();
        requests
            .entry(key.clone())
            .or_insert_with(|| RawRequest::new(b.clone(), query.clone()));
        requests.get_mut(&key).expect("just inserted").request(attributes, filter, kind);
    }
}

/// The core role-classification/posting pass of spec.md §4.3: walks every
/// measure-providing block, posts cross-block attribute/filter requests
/// for whatever it cannot satisfy on its own, then finalizes every touched
/// block's request (including pure filter-provider blocks that never
/// appear in `block_measures`).
pub fn post_requests(
    query: &Arc<Query>,
    block_measures: &[BlockMeta],
    block_filters: &[BlockMeta],
    registry: &Registry,
) -> PlanResult<HashMap<String, RawRequest>> {
    let mut requests: HashMap<String, RawRequest> = HashMap::new();
    let boundary_query = query.filter_boundary();
    let query_filter_attributes = boundary_query.attributes();
    let measure_num = query.num_measures();

    for b in block_measures {
        let boundary_block = b.boundary();
        let attributes_block = b.schema().attribute_names();
        let filter_rel = boundary_block.relationship(boundary_query, registry)?;
        if filter_rel == SetRelation::Disjoint {
            continue;
        }
        let boundary_block_query = boundary_block.intersect(boundary_query)?;

        for i in 0..measure_num {
            let attributes_measure = query.attributes_in_measure(i);
            let attributes_diff = set_difference(attributes_measure, &attributes_block);
            if attributes_diff.is_empty() || attributes_diff.len() == attributes_measure.len() {
                continue;
            }
            let targets = filter_blocks(block_measures, &boundary_block_query, &attributes_diff, registry)?;
            post_requests_to(
                query,
                &targets,
                Some(&boundary_block_query),
                &attributes_diff,
                RequestKind::Measure,
                &mut requests,
            );
        }

        requests
            .entry(b.key())
            .or_insert_with(|| RawRequest::new(b.clone(), query.clone()));

        if matches!(filter_rel, SetRelation::Subset | SetRelation::Equal) {
            requests.get_mut(&b.key()).expect("just ensured").passed_filter_attributes =
                query_filter_attributes.clone();
        } else {
            let boundary_extra = converge_boundary(boundary_block, boundary_query)?;
            let boundary_extra_attributes = boundary_extra.attributes();
            let extra_not_in_block = set_difference(&boundary_extra_attributes, &attributes_block);

            if !extra_not_in_block.is_empty() {
                let targets = filter_blocks(block_filters, &boundary_block_query, &extra_not_in_block, registry)?;
                post_requests_to(
                    query,
                    &targets,
                    Some(&boundary_block_query),
                    &extra_not_in_block,
                    RequestKind::Filter,
                    &mut requests,
                );
            }

            let entry = requests.get_mut(&b.key()).expect("just ensured");
            entry.passed_filter_attributes = set_difference(&query_filter_attributes, &extra_not_in_block);
            entry.extra_check_filter_attributes = set_intersection(&boundary_extra_attributes, &attributes_block);
        }
    }

    let measure_keys: HashSet<String> = block_measures.iter().map(BlockMeta::key).collect();
    let pure_filter_keys: Vec<String> = requests
        .keys()
        .filter(|k| !measure_keys.contains(*k))
        .cloned()
        .collect();
    for key in pure_filter_keys {
        let (boundary_extra_attributes, block_attributes) = {
            let req = &requests[&key];
            let extra = converge_boundary(req.block.boundary(), boundary_query)?.attributes();
            (extra, req.block.schema().attribute_names())
        };
        let extra_not_in_block = set_difference(&boundary_extra_attributes, &block_attributes);
        let req = requests.get_mut(&key).expect("key from requests");
        req.passed_filter_attributes = set_difference(&query_filter_attributes, &extra_not_in_block);
        req.extra_check_filter_attributes = set_intersection(&boundary_extra_attributes, &block_attributes);
    }

    for req in requests.values_mut() {
        req.finalize()?;
    }

    Ok(requests)
}
