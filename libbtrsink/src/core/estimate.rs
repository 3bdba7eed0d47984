use super::Store;
use crate::model::Diff;
use strum_macros::Display as StrumDisplay;

/// How diff costs are determined for a planning round. Selected by the
/// occurrence count of the estimate flag: measure by default, quota data
/// once, stored logical sizes only when given twice or more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "lowercase")]
pub enum EstimateMode {
    Measure,
    Quota,
    Logical,
}

impl EstimateMode {
    pub fn from_occurrences(count: u64) -> Self {
        match count {
            0 => EstimateMode::Measure,
            1 => EstimateMode::Quota,
            _ => EstimateMode::Logical,
        }
    }

    /// Whether quota accounting should be refreshed before planning.
    pub fn uses_quota(self) -> bool {
        !matches!(self, EstimateMode::Logical)
    }

    pub fn measures(self) -> bool {
        matches!(self, EstimateMode::Measure)
    }
}

/// Annotate every candidate edge with `(size, exact)` for one planning
/// round. Edges that already carry an exact size pass through untouched;
/// edges their owning store cannot size are dropped, which the planner
/// treats as the edge being absent.
pub async fn annotate_edges(
    edges: Vec<Diff>,
    mode: EstimateMode,
    source: &mut dyn Store,
    dest: &mut dyn Store,
) -> Vec<Diff> {
    let mut annotated = Vec::with_capacity(edges.len());
    for mut edge in edges {
        if edge.exact {
            annotated.push(edge);
            continue;
        }
        let owner: &mut dyn Store = if edge.sink == source.name() {
            &mut *source
        } else if edge.sink == dest.name() {
            &mut *dest
        } else {
            slog_scope::warn!("dropping diff {} from unknown sink", edge);
            continue;
        };
        let sized = if mode.measures() {
            owner.measure_size(&edge).await.map(|size| (size, true))
        } else {
            owner.estimate_size(&edge).await.map(|size| (size, false))
        };
        match sized {
            Ok((size, exact)) => {
                edge.size = size;
                edge.exact = exact;
                annotated.push(edge);
            }
            Err(error) => {
                slog_scope::warn!("dropping unsizable diff {}: {:#}", edge, error);
            }
        }
    }
    annotated
}
