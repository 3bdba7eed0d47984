use crate::model::{Diff, IdentityIndex, Volume};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// One planning round's input: the current enumeration of both stores and
/// the union of candidate diff edges across them, already annotated with
/// sizes by the estimator.
pub struct PlanRequest<'a> {
    pub source_volumes: &'a [Volume],
    pub dest_volumes: &'a [Volume],
    pub dest_name: &'a str,
    pub edges: &'a [Diff],
}

/// The chosen way to materialize one source volume on the destination.
/// `keep` means the volume is already resident and costs nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Canonical (source-side) identity of the volume.
    pub uuid: Uuid,
    pub otime: DateTime<Utc>,
    /// Store supplying the bytes, or the destination itself for keeps.
    pub diff_sink: String,
    /// Chosen parent, None for a full send or a keep.
    pub previous: Option<Uuid>,
    /// Cost attributed to this choice (this diff alone, not the chain).
    pub size: u64,
    pub exact: bool,
    /// Diff count on the chain from a destination-resident ancestor.
    pub ancestors: u32,
    pub keep: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// One node per reachable source volume, in `(otime, uuid)` order.
    pub nodes: Vec<Node>,
    /// Source volumes no store can produce on the destination.
    pub unreachable: Vec<Uuid>,
    dest_name: String,
    resident: HashSet<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkTotal {
    pub count: usize,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanSummary {
    pub sinks: BTreeMap<String, SinkTotal>,
    pub total: SinkTotal,
}

impl Plan {
    pub fn dest_name(&self) -> &str {
        &self.dest_name
    }

    /// Nodes that still require a transfer.
    pub fn pending(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.keep)
    }

    pub fn is_synchronized(&self) -> bool {
        self.pending().next().is_none()
    }

    /// The earliest pending diff whose parent is already resident on the
    /// destination (or that needs no parent).
    pub fn next_ready(&self) -> Option<&Node> {
        self.pending()
            .find(|n| n.previous.map(|p| self.resident.contains(&p)).unwrap_or(true))
    }

    /// Total bytes the plan would transfer.
    pub fn total_size(&self) -> u64 {
        self.pending().map(|n| n.size).sum()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut sinks: BTreeMap<String, SinkTotal> = BTreeMap::new();
        let mut total = SinkTotal::default();
        for node in &self.nodes {
            let entry = sinks.entry(node.diff_sink.clone()).or_default();
            entry.count += 1;
            entry.size += node.size;
            total.count += 1;
            total.size += node.size;
        }
        PlanSummary { sinks, total }
    }

    /// Canonical ids the plan relies on as diff parents. Destination volumes
    /// outside the source set must survive pruning when listed here.
    pub fn required_ancestors(&self) -> HashSet<Uuid> {
        self.nodes.iter().filter_map(|n| n.previous).collect()
    }

    pub fn is_resident(&self, uuid: Uuid) -> bool {
        self.resident.contains(&uuid)
    }
}

#[derive(Clone)]
struct Candidate {
    cost: u64,
    /// Tie-break rank: keep, then incremental, then full.
    rank: u8,
    ancestors: u32,
    sink: String,
    previous: Option<Uuid>,
    size: u64,
    exact: bool,
}

impl Candidate {
    fn key(&self) -> (u64, u8, u32, &str, Uuid) {
        (
            self.cost,
            self.rank,
            self.ancestors,
            self.sink.as_str(),
            self.previous.unwrap_or_else(Uuid::nil),
        )
    }
}

/// Pick, for every source volume, the cheapest way to materialize it on the
/// destination: a shortest-path relaxation over the candidate-diff DAG with
/// a virtual zero-cost root at every destination-resident volume.
///
/// Never fails; malformed edges are dropped with a warning and volumes with
/// no path are reported as unreachable.
pub fn solve(request: &PlanRequest) -> Plan {
    let identity = IdentityIndex::build(request.source_volumes.iter().chain(request.dest_volumes.iter()));

    // Representative metadata per canonical id; source metadata wins when
    // both sides hold a volume.
    let mut meta: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    for volume in request.dest_volumes {
        meta.insert(identity.resolve(volume.uuid), volume.otime);
    }
    for volume in request.source_volumes {
        meta.insert(identity.resolve(volume.uuid), volume.otime);
    }

    let resident: HashSet<Uuid> = request
        .dest_volumes
        .iter()
        .map(|v| identity.resolve(v.uuid))
        .collect();

    let mut order: Vec<Uuid> = meta.keys().copied().collect();
    order.sort_by_key(|u| (meta[u], *u));
    let position: HashMap<Uuid, usize> = order.iter().enumerate().map(|(i, u)| (*u, i)).collect();

    let mut edges_by_target: HashMap<Uuid, Vec<Diff>> = HashMap::new();
    for edge in request.edges {
        let to = identity.resolve(edge.to_uuid);
        let from = edge.from_uuid.map(|f| identity.resolve(f));
        if let Some(from) = from {
            if from == to {
                slog_scope::warn!("dropping self-referential diff {}", edge);
                continue;
            }
            match (position.get(&from), position.get(&to)) {
                (Some(from_pos), Some(to_pos)) if from_pos >= to_pos => {
                    slog_scope::warn!(
                        "dropping diff {} whose parent postdates its child (corrupt parent metadata?)",
                        edge
                    );
                    continue;
                }
                (None, _) => {
                    slog_scope::debug!("ignoring diff {} from a volume no store holds", edge);
                    continue;
                }
                _ => {}
            }
        }
        edges_by_target.entry(to).or_default().push(Diff {
            to_uuid: to,
            from_uuid: from,
            ..edge.clone()
        });
    }

    let mut best: HashMap<Uuid, Candidate> = HashMap::new();
    for uuid in &order {
        let mut candidates: Vec<Candidate> = Vec::new();
        if resident.contains(uuid) {
            candidates.push(Candidate {
                cost: 0,
                rank: 0,
                ancestors: 0,
                sink: request.dest_name.to_string(),
                previous: None,
                size: 0,
                exact: true,
            });
        }
        for edge in edges_by_target.get(uuid).map(|e| e.as_slice()).unwrap_or_default() {
            match edge.from_uuid {
                Some(from) => {
                    if let Some(parent) = best.get(&from) {
                        candidates.push(Candidate {
                            cost: parent.cost.saturating_add(edge.size),
                            rank: 1,
                            ancestors: parent.ancestors + 1,
                            sink: edge.sink.clone(),
                            previous: Some(from),
                            size: edge.size,
                            exact: edge.exact,
                        });
                    }
                }
                None => candidates.push(Candidate {
                    cost: edge.size,
                    rank: 2,
                    ancestors: 1,
                    sink: edge.sink.clone(),
                    previous: None,
                    size: edge.size,
                    exact: edge.exact,
                }),
            }
        }
        candidates.sort_by(|a, b| a.key().cmp(&b.key()));
        if let Some(chosen) = candidates.into_iter().next() {
            best.insert(*uuid, chosen);
        }
    }

    let source_canon: HashSet<Uuid> = request
        .source_volumes
        .iter()
        .map(|v| identity.resolve(v.uuid))
        .collect();

    let mut nodes = Vec::new();
    let mut unreachable = Vec::new();
    for uuid in order.iter().filter(|u| source_canon.contains(u)) {
        match best.get(uuid) {
            Some(candidate) => nodes.push(Node {
                uuid: *uuid,
                otime: meta[uuid],
                diff_sink: candidate.sink.clone(),
                previous: candidate.previous,
                size: candidate.size,
                exact: candidate.exact,
                ancestors: candidate.ancestors,
                keep: candidate.rank == 0,
            }),
            None => {
                slog_scope::warn!("{}", super::SyncError::DiffUnreachable(*uuid));
                unreachable.push(*uuid);
            }
        }
    }

    Plan {
        nodes,
        unreachable,
        dest_name: request.dest_name.to_string(),
        resident,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vol(uuid: u128, otime: i64, parent: Option<u128>) -> Volume {
        Volume {
            uuid: Uuid::from_u128(uuid),
            parent_uuid: parent.map(Uuid::from_u128),
            received_uuid: None,
            otime: Utc.timestamp(otime, 0),
            size: 0,
            paths: vec![format!("snap-{}", uuid)],
        }
    }

    fn received_vol(uuid: u128, mirrors: u128, otime: i64) -> Volume {
        Volume {
            received_uuid: Some(Uuid::from_u128(mirrors)),
            ..vol(uuid, otime, None)
        }
    }

    fn edge(from: Option<u128>, to: u128, sink: &str, size: u64) -> Diff {
        Diff {
            to_uuid: Uuid::from_u128(to),
            from_uuid: from.map(Uuid::from_u128),
            sink: sink.to_string(),
            size,
            exact: false,
        }
    }

    fn solve_simple(source: &[Volume], dest: &[Volume], edges: &[Diff]) -> Plan {
        solve(&PlanRequest {
            source_volumes: source,
            dest_volumes: dest,
            dest_name: "dst",
            edges,
        })
    }

    #[test]
    fn empty_to_one_uses_full_send() {
        let source = vec![vol(1, 1, None)];
        let edges = vec![edge(None, 1, "src", 100)];
        let plan = solve_simple(&source, &[], &edges);

        assert_eq!(plan.nodes.len(), 1);
        assert!(plan.unreachable.is_empty());
        let node = plan.next_ready().unwrap();
        assert_eq!(node.uuid, Uuid::from_u128(1));
        assert_eq!(node.previous, None);
        assert_eq!(node.size, 100);
        assert!(!node.keep);
        assert_eq!(plan.total_size(), 100);
    }

    #[test]
    fn linear_chain_keeps_common_ancestor() {
        let source = vec![vol(1, 1, None), vol(2, 2, Some(1)), vol(3, 3, Some(2))];
        let dest = vec![vol(1, 1, None)];
        let edges = vec![
            edge(None, 1, "src", 100),
            edge(None, 2, "src", 110),
            edge(None, 3, "src", 110),
            edge(Some(1), 2, "src", 10),
            edge(Some(2), 3, "src", 10),
        ];
        let plan = solve_simple(&source, &dest, &edges);

        assert!(plan.unreachable.is_empty());
        assert_eq!(plan.total_size(), 20);
        assert!(plan.nodes[0].keep);
        let ready = plan.next_ready().unwrap();
        assert_eq!(ready.uuid, Uuid::from_u128(2));
        assert_eq!(ready.previous, Some(Uuid::from_u128(1)));

        // After the first transfer lands, a fresh round still picks B -> C.
        let dest = vec![vol(1, 1, None), received_vol(20, 2, 2)];
        let plan = solve_simple(&source, &dest, &edges);
        assert_eq!(plan.total_size(), 10);
        let ready = plan.next_ready().unwrap();
        assert_eq!(ready.uuid, Uuid::from_u128(3));
        assert_eq!(ready.previous, Some(Uuid::from_u128(2)));
    }

    #[test]
    fn resident_descendant_is_kept_without_a_chain() {
        let source = vec![vol(1, 1, None), vol(2, 2, Some(1)), vol(3, 3, Some(2))];
        let dest = vec![vol(1, 1, None), vol(3, 3, Some(2))];
        let edges = vec![
            edge(None, 1, "src", 100),
            edge(None, 2, "src", 110),
            edge(None, 3, "src", 110),
            edge(Some(1), 2, "src", 10),
            edge(Some(2), 3, "src", 10),
        ];
        let plan = solve_simple(&source, &dest, &edges);

        assert_eq!(plan.total_size(), 10);
        assert_eq!(plan.pending().count(), 1);
        assert_eq!(plan.next_ready().unwrap().uuid, Uuid::from_u128(2));
        assert!(plan.nodes.iter().filter(|n| n.keep).count() == 2);
    }

    #[test]
    fn volume_without_any_path_is_unreachable() {
        // X's parent is unknown to every store and no full send exists.
        let source = vec![vol(9, 5, Some(1000))];
        let edges = vec![edge(Some(1000), 9, "src", 10)];
        let plan = solve_simple(&source, &[], &edges);

        assert!(plan.nodes.is_empty());
        assert_eq!(plan.unreachable, vec![Uuid::from_u128(9)]);
        assert!(plan.is_synchronized());
    }

    #[test]
    fn equal_cost_ties_break_on_parent_uuid() {
        let source = vec![vol(1, 1, None), vol(2, 2, None), vol(5, 5, None)];
        let dest = vec![vol(1, 1, None), vol(2, 2, None)];
        let edges = vec![
            edge(Some(1), 5, "src", 10),
            edge(Some(2), 5, "src", 10),
            edge(None, 5, "src", 100),
        ];
        let plan = solve_simple(&source, &dest, &edges);
        let node = plan.next_ready().unwrap();
        assert_eq!(node.previous, Some(Uuid::from_u128(1)));

        // Identical input, identical plan.
        let replay = solve_simple(&source, &dest, &edges);
        assert_eq!(plan, replay);
    }

    #[test]
    fn keep_beats_zero_cost_transfer() {
        let source = vec![vol(1, 1, None), vol(2, 2, Some(1))];
        let dest = vec![vol(1, 1, None), vol(2, 2, Some(1))];
        let edges = vec![edge(None, 1, "src", 0), edge(Some(1), 2, "src", 0)];
        let plan = solve_simple(&source, &dest, &edges);
        assert!(plan.is_synchronized());
        assert!(plan.nodes.iter().all(|n| n.keep));
    }

    #[test]
    fn incremental_preferred_over_equal_cost_full() {
        let source = vec![vol(1, 1, None), vol(2, 2, Some(1))];
        let dest = vec![vol(1, 1, None)];
        let edges = vec![edge(Some(1), 2, "src", 50), edge(None, 2, "src", 50)];
        let plan = solve_simple(&source, &dest, &edges);
        let node = plan.next_ready().unwrap();
        assert_eq!(node.previous, Some(Uuid::from_u128(1)));
    }

    #[test]
    fn received_uuid_establishes_residency() {
        let source = vec![vol(1, 1, None), vol(2, 2, Some(1))];
        // The destination's copy of volume 1 has its own uuid.
        let dest = vec![received_vol(77, 1, 1)];
        let edges = vec![
            edge(None, 1, "src", 100),
            edge(None, 2, "src", 110),
            edge(Some(1), 2, "src", 10),
        ];
        let plan = solve_simple(&source, &dest, &edges);

        assert_eq!(plan.total_size(), 10);
        assert!(plan.is_resident(Uuid::from_u128(1)));
        let ready = plan.next_ready().unwrap();
        assert_eq!(ready.uuid, Uuid::from_u128(2));
        assert_eq!(ready.previous, Some(Uuid::from_u128(1)));
    }

    #[test]
    fn parent_cycles_are_dropped_not_followed() {
        // Corrupt metadata: 1 and 2 claim each other as parents.
        let source = vec![vol(1, 1, Some(2)), vol(2, 2, Some(1))];
        let edges = vec![
            edge(Some(2), 1, "src", 10),
            edge(Some(1), 2, "src", 10),
            edge(None, 1, "src", 100),
            edge(None, 2, "src", 200),
        ];
        let plan = solve_simple(&source, &[], &edges);

        assert!(plan.unreachable.is_empty());
        // The back-edge 2 -> 1 is refused; 1 full-sends, 2 rides on it.
        assert_eq!(plan.nodes[0].previous, None);
        assert_eq!(plan.nodes[1].previous, Some(Uuid::from_u128(1)));
        assert_eq!(plan.total_size(), 110);
    }

    #[test]
    fn adding_destination_volume_never_raises_cost() {
        let source = vec![vol(1, 1, None), vol(2, 2, Some(1)), vol(3, 3, Some(2))];
        let edges = vec![
            edge(None, 1, "src", 100),
            edge(None, 2, "src", 110),
            edge(None, 3, "src", 110),
            edge(Some(1), 2, "src", 10),
            edge(Some(2), 3, "src", 10),
        ];
        let sparse = solve_simple(&source, &[vol(1, 1, None)], &edges);
        let denser = solve_simple(&source, &[vol(1, 1, None), vol(2, 2, Some(1))], &edges);
        assert!(denser.total_size() <= sparse.total_size());
    }

    #[test]
    fn rerun_after_sync_is_empty() {
        let source = vec![vol(1, 1, None), vol(2, 2, Some(1))];
        let dest = vec![vol(1, 1, None), received_vol(50, 2, 2)];
        let edges = vec![edge(None, 1, "src", 100), edge(Some(1), 2, "src", 10)];
        let plan = solve_simple(&source, &dest, &edges);
        assert!(plan.is_synchronized());
        assert_eq!(plan.total_size(), 0);
    }

    #[test]
    fn summary_groups_by_sink() {
        let source = vec![vol(1, 1, None), vol(2, 2, Some(1)), vol(3, 3, Some(2))];
        let dest = vec![vol(1, 1, None)];
        let edges = vec![
            edge(Some(1), 2, "src", 10),
            edge(Some(2), 3, "mirror", 7),
            edge(None, 2, "src", 100),
            edge(None, 3, "src", 100),
        ];
        let plan = solve_simple(&source, &dest, &edges);
        let summary = plan.summary();

        assert_eq!(summary.total, SinkTotal { count: 3, size: 17 });
        assert_eq!(summary.sinks["dst"], SinkTotal { count: 1, size: 0 });
        assert_eq!(summary.sinks["src"], SinkTotal { count: 1, size: 10 });
        assert_eq!(summary.sinks["mirror"], SinkTotal { count: 1, size: 7 });
    }

    #[test]
    fn required_ancestors_protect_parents_from_pruning() {
        let source = vec![vol(2, 2, Some(1))];
        let dest = vec![vol(1, 1, None), vol(9, 9, None)];
        let edges = vec![edge(Some(1), 2, "src", 10), edge(None, 2, "src", 100)];
        let plan = solve_simple(&source, &dest, &edges);

        let required = plan.required_ancestors();
        assert!(required.contains(&Uuid::from_u128(1)));
        assert!(!required.contains(&Uuid::from_u128(9)));
    }
}
