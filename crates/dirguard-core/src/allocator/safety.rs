/// Banker's safety scan.
///
/// Pure functions over plain vectors so the scan can be evaluated on a
/// hypothetical state before it is committed. The allocator calls these
/// while holding its ledger lock.
use std::iter::zip;

/// Remaining demand per process: `max_claim[p][r] - allocated[p][r]`.
pub fn need(max_claim: &[Vec<u32>], allocated: &[Vec<u32>]) -> Vec<Vec<u32>> {
    zip(max_claim, allocated)
        .map(|(ceiling, held)| {
            zip(ceiling, held)
                .map(|(&m, &a)| m.saturating_sub(a))
                .collect()
        })
        .collect()
}

/// Find a completion order in which every process can obtain its full
/// remaining demand, starting from `available` units.
///
/// Each pass walks the processes in index order and finishes every process
/// whose whole `need` vector fits in `work`, returning its allocation to
/// `work`. Passes repeat until one finishes nobody. Returns the order in
/// which processes were finished, or `None` if some process never could be.
pub fn safe_sequence(
    available: &[u32],
    allocated: &[Vec<u32>],
    max_claim: &[Vec<u32>],
) -> Option<Vec<usize>> {
    let need = need(max_claim, allocated);
    let processes = need.len();

    let mut work = available.to_vec();
    let mut finished = vec![false; processes];
    let mut order = Vec::with_capacity(processes);

    loop {
        let mut progressed = false;
        for pid in 0..processes {
            if finished[pid] {
                continue;
            }
            let fits = zip(&need[pid], &work).all(|(&n, &w)| n <= w);
            if fits {
                // Pretend the process runs to completion and hands back
                // everything it holds.
                for (w, &held) in zip(&mut work, &allocated[pid]) {
                    *w += held;
                }
                finished[pid] = true;
                order.push(pid);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    (order.len() == processes).then_some(order)
}

/// True iff some completion order exists for the given state.
pub fn is_safe(available: &[u32], allocated: &[Vec<u32>], max_claim: &[Vec<u32>]) -> bool {
    safe_sequence(available, allocated, max_claim).is_some()
}
