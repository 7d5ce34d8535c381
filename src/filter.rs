/// Filter Engine (spec §4.3): pure, synchronous predicates over block,
/// transaction and action filters, plus cron-timestamp semantics.
use crate::model::{ActionFilter, Block, BlockFilter, CronFilter, Transaction};
use std::str::FromStr;
use tracing::info;

/// `filterBlock(block, f)`.
pub fn filter_block(height: i64, modulo_filters: &[BlockFilter]) -> bool {
    if modulo_filters.is_empty() {
        return true;
    }
    modulo_filters.iter().any(|f| match f.modulo {
        Some(m) if m > 0 => height % (m as i64) == 0,
        _ => true,
    })
}

/// `filterTransaction(tx, f)`.
///
/// Spec §9 open question: the literal spec text says this "passes
/// unconditionally at core level," deferring sender/receiver filtering to
/// the dictionary. That leaves the in-process (non-dictionary) path
/// behaviorally asymmetric with the dictionary path — flagged in the spec as
/// possibly a latent bug. Resolved here (see DESIGN.md) by making both paths
/// symmetric: when a `TransactionFilter` sets `sender`/`receiver`, the core
/// filter now enforces it too.
pub fn filter_transaction(tx: &Transaction, filters: &[crate::model::TransactionFilter]) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|f| {
        let sender_ok = f.sender.as_ref().map_or(true, |s| s == &tx.signer_id);
        let receiver_ok = f.receiver.as_ref().map_or(true, |r| r == &tx.receiver_id);
        sender_ok && receiver_ok
    })
}

/// `filterAction(a, f)`.
pub fn filter_action(action_type: &str, filters: &[ActionFilter]) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|f| {
        if f.action_type.is_empty() {
            true
        } else {
            f.action_type == action_type
        }
        // `f.action` is intentionally unconsulted — reserved/no-op (spec §9).
    })
}

/// Compile a cron string into a `CronFilter`, evaluated against the block at
/// the datasource's `startBlock` (spec §3's cron-augmented filter).
pub fn compile_cron_filter(
    cron_expr: &str,
    anchor_timestamp_ms: i64,
) -> Result<CronFilter, String> {
    let schedule = cron::Schedule::from_str(cron_expr).map_err(|e| e.to_string())?;
    let anchor = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(anchor_timestamp_ms)
        .ok_or_else(|| "invalid anchor timestamp".to_string())?;
    let next = schedule
        .after(&anchor)
        .next()
        .ok_or_else(|| "cron schedule has no future occurrence".to_string())?;
    Ok(CronFilter { schedule, next })
}

/// Cron-timestamp match semantics (spec §4.3):
///
/// Compare `block.timestamp` to `filter.next`. If greater, log, advance the
/// schedule forward once, then rewind one tick (so a re-query within the
/// same slot is idempotent), and report a match. Otherwise rewind one tick
/// and report no match.
pub fn match_cron(filter: &mut CronFilter, block_timestamp_ms: i64) -> bool {
    let block_time = match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(block_timestamp_ms)
    {
        Some(t) => t,
        None => return false,
    };

    if block_time > filter.next {
        info!(next = %filter.next, block_time = %block_time, "cron filter advancing");
        let advanced = filter
            .schedule
            .after(&filter.next)
            .next()
            .unwrap_or(filter.next);
        filter.next = rewind_one_tick(&filter.schedule, advanced);
        true
    } else {
        filter.next = rewind_one_tick(&filter.schedule, filter.next);
        false
    }
}

/// Rewind `next` one slot: the previous occurrence strictly before it.
fn rewind_one_tick(
    schedule: &cron::Schedule,
    next: chrono::DateTime<chrono::Utc>,
) -> chrono::DateTime<chrono::Utc> {
    // `cron`'s Schedule has no `before` iterator; approximate by scanning
    // forward from a safe lower bound and keeping the last occurrence
    // strictly less than `next`.
    let lower_bound = next - chrono::Duration::days(366);
    schedule
        .after(&lower_bound)
        .take_while(|t| *t < next)
        .last()
        .unwrap_or(next)
}

/// `filterBlock`/`filterTransaction`/`filterAction` accept
/// `filter | filter[] | undefined`; this is realized upstream by normalizing
/// into a `Vec` at datasource-load time (see `crate::manifest`), so these
/// functions always take a slice — empty meaning "unconditional pass."
///
/// Per spec §4.3, each filter entry passes only if its modulo check AND its
/// cron-timestamp check both pass; the block passes if any entry passes.
/// `timestamp_matches[i]` is the caller-resolved cron match for
/// `filters[i]` (compiling/advancing a `CronFilter` needs mutable,
/// per-handler state, which this pure function doesn't own — see
/// `Indexer::eval_cron`); entries with no `timestamp` ignore it.
pub fn block_passes(block: &Block, filters: &[BlockFilter], timestamp_matches: &[bool]) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().enumerate().any(|(i, f)| {
        let modulo_ok = filter_block(block.header.height, std::slice::from_ref(f));
        let timestamp_ok = f.timestamp.is_none() || timestamp_matches.get(i).copied().unwrap_or(true);
        modulo_ok && timestamp_ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionFilter;

    fn tx(signer: &str, receiver: &str) -> Transaction {
        Transaction {
            hash: "h".into(),
            signer_id: signer.into(),
            receiver_id: receiver.into(),
            actions: vec![],
            gas_price: "1".into(),
            gas_used: 0,
            block_hash: "bh".into(),
            block_height: 1,
            timestamp: 0,
            result: crate::model::TxResult {
                id: "r".into(),
                logs: vec![],
            },
        }
    }

    #[test]
    fn filter_block_modulo_matches() {
        let f = vec![BlockFilter {
            modulo: Some(100),
            timestamp: None,
        }];
        assert!(filter_block(1000, &f));
        assert!(!filter_block(1001, &f));
    }

    #[test]
    fn filter_block_empty_passes() {
        assert!(filter_block(42, &[]));
    }

    #[test]
    fn filter_block_any_of_multiple_moduli() {
        let f = vec![
            BlockFilter {
                modulo: Some(7),
                timestamp: None,
            },
            BlockFilter {
                modulo: Some(11),
                timestamp: None,
            },
        ];
        assert!(filter_block(22, &f));
        assert!(filter_block(21, &f));
        assert!(!filter_block(23, &f));
    }

    #[test]
    fn filter_transaction_symmetric_sender_receiver() {
        let f = vec![TransactionFilter {
            sender: Some("alice.near".into()),
            receiver: None,
        }];
        assert!(filter_transaction(&tx("alice.near", "bob.near"), &f));
        assert!(!filter_transaction(&tx("carol.near", "bob.near"), &f));
    }

    #[test]
    fn filter_action_matches_type() {
        let f = vec![ActionFilter {
            action_type: "Transfer".into(),
            action: None,
        }];
        assert!(filter_action("Transfer", &f));
        assert!(!filter_action("Stake", &f));
    }

    #[test]
    fn filter_action_empty_passes() {
        assert!(filter_action("anything", &[]));
    }

    #[test]
    fn block_passes_ands_modulo_and_timestamp() {
        let block = Block {
            author: "validator.near".into(),
            header: crate::model::BlockHeader {
                height: 100,
                hash: "h".into(),
                prev_hash: "p".into(),
                timestamp: 0,
                gas_price: "1".into(),
            },
            chunks: vec![],
            transactions: vec![],
            actions: vec![],
            receipts: vec![],
        };
        let f = vec![BlockFilter {
            modulo: Some(100),
            timestamp: Some("0 * * * * *".into()),
        }];
        // Modulo matches but the caller-resolved cron match is false.
        assert!(!block_passes(&block, &f, &[false]));
        // Both match.
        assert!(block_passes(&block, &f, &[true]));
    }

    #[test]
    fn cron_matches_then_rewinds_idempotently() {
        // Every minute.
        let mut f = compile_cron_filter("0 * * * * *", 0).unwrap();
        let first_next_ms = f.next.timestamp_millis();
        assert!(match_cron(&mut f, first_next_ms + 1000));
        // Re-querying at a time still before the (now advanced) next slot
        // must not match again.
        assert!(!match_cron(&mut f, first_next_ms + 1500));
    }
}
