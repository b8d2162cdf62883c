//! End-to-end status walks against the loopback broker.

use std::time::Duration;

use flux_overlay::errors::errors_report;
use flux_overlay::health::{StatusFilter, StatusOptions, highlight_ranks, status_report};
use flux_overlay::idset::IdSet;
use flux_overlay::topology::OverlayCtx;
use flux_testkit::{TestBroker, TestNet};

const RED_LOST: &str = "\x1b[31mlost\x1b[39m";
const GRAY_LOST: &str = "\x1b[90mlost\x1b[39m";

fn opts() -> StatusOptions {
    StatusOptions {
        timeout: Some(Duration::from_millis(200)),
        ..StatusOptions::default()
    }
}

async fn report(
    ctx: &OverlayCtx,
    opts: StatusOptions,
    rank: u32,
    filter: StatusFilter,
) -> String {
    let mut out = Vec::new();
    status_report(ctx, opts, rank, filter, &mut out)
        .await
        .expect("status walk");
    String::from_utf8(out).expect("utf-8 report")
}

#[tokio::test]
async fn show_all_prints_every_node_once() {
    let broker = TestBroker::start(TestNet::kary(7, 2));
    let ctx = OverlayCtx::new(broker.client());

    let text = report(&ctx, opts(), 0, StatusFilter::All).await;
    let expected = "\
0 host0: full
├─ 1 host1: full
│  ├─ 3 host3: full
│  └─ 4 host4: full
└─ 2 host2: full
   ├─ 5 host5: full
   └─ 6 host6: full
";
    assert_eq!(text, expected);
}

#[tokio::test]
async fn summary_prints_root_status_only() {
    let net = TestNet::kary(7, 2).set_status(0, "partial");
    let broker = TestBroker::start(net);
    let ctx = OverlayCtx::new(broker.client());

    let text = report(&ctx, opts(), 0, StatusFilter::Summary).await;
    assert_eq!(text, "partial\n");
}

#[tokio::test]
async fn badtrees_with_lost_child_ghosts_its_subtree() {
    // rank 2 is gone; its children 5 and 6 can only be presumed lost
    let net = TestNet::kary(7, 2)
        .set_status(0, "partial")
        .set_status(2, "lost")
        .set_error(2, "socket closed");
    let broker = TestBroker::start(net);
    let ctx = OverlayCtx::new(broker.client());

    let text = report(
        &ctx,
        StatusOptions {
            color: true,
            ..opts()
        },
        0,
        StatusFilter::Down,
    )
    .await;

    let expected = format!(
        "0 host0: partial\n\
         └─ 2 host2: {} socket closed\n   \
         ├─ 5 host5: {}\n   \
         └─ 6 host6: {}\n",
        RED_LOST, GRAY_LOST, GRAY_LOST
    );
    assert_eq!(text, expected);
    // the healthy subtree under rank 1 is not mentioned
    assert!(!text.contains("host1"));
    assert!(!text.contains("host3"));
}

#[tokio::test]
async fn ghost_nodes_inherit_ancestor_status() {
    // rank 1 is offline; its children are scripted healthy but can only be
    // presumed offline
    let net = TestNet::kary(7, 2)
        .set_status(0, "partial")
        .set_status(1, "offline");
    let broker = TestBroker::start(net);
    let ctx = OverlayCtx::new(broker.client());

    let text = report(&ctx, opts(), 0, StatusFilter::All).await;
    assert!(text.contains("├─ 1 host1: offline\n"));
    assert!(text.contains("│  ├─ 3 host3: offline\n"));
    assert!(text.contains("│  └─ 4 host4: offline\n"));
}

#[tokio::test]
async fn no_ghost_suppresses_presumed_nodes() {
    let net = TestNet::kary(7, 2)
        .set_status(0, "partial")
        .set_status(1, "offline");
    let broker = TestBroker::start(net);
    let ctx = OverlayCtx::new(broker.client());

    let text = report(
        &ctx,
        StatusOptions {
            no_ghost: true,
            ..opts()
        },
        0,
        StatusFilter::All,
    )
    .await;
    assert!(text.contains("1 host1: offline"));
    assert!(!text.contains("host3"));
    assert!(!text.contains("host4"));
}

#[tokio::test]
async fn unreachable_rank_reports_error_then_ghosts() {
    // rank 1 still claims "degraded" per its parent but never answers
    let net = TestNet::kary(7, 2)
        .set_status(0, "partial")
        .set_status(1, "degraded")
        .set_unreachable(1);
    let broker = TestBroker::start(net);
    let ctx = OverlayCtx::new(broker.client());

    let text = report(&ctx, opts(), 0, StatusFilter::All).await;
    assert!(text.contains("├─ 1 host1: timed out\n"), "got: {:?}", text);
    assert!(text.contains("│  ├─ 3 host3: degraded\n"));
    assert!(text.contains("│  └─ 4 host4: degraded\n"));
    // siblings are still probed
    assert!(text.contains("└─ 2 host2: full\n"));
}

#[tokio::test]
async fn walk_failure_at_root_is_fatal() {
    let net = TestNet::kary(3, 2).set_unreachable(0);
    let broker = TestBroker::start(net);
    let ctx = OverlayCtx::new(broker.client());

    let mut out = Vec::new();
    let err = status_report(&ctx, opts(), 0, StatusFilter::All, &mut out)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn highlight_marks_ancestor_subtrees() {
    let broker = TestBroker::start(TestNet::kary(7, 2));
    let ctx = OverlayCtx::new(broker.client());

    let highlight = highlight_ranks(&ctx, &["5".to_string()]).await.unwrap();
    let text = report(
        &ctx,
        StatusOptions {
            highlight,
            ..opts()
        },
        0,
        StatusFilter::All,
    )
    .await;
    assert!(text.contains("<<0 host0>>: full"));
    assert!(text.contains("<<2 host2>>: full"));
    assert!(text.contains("<<5 host5>>: full"));
    assert!(text.contains("├─ 1 host1: full")); // not highlighted
}

#[tokio::test]
async fn highlight_accepts_hostnames_and_validates_ranks() {
    let broker = TestBroker::start(TestNet::kary(7, 2));
    let ctx = OverlayCtx::new(broker.client());

    let ids = highlight_ranks(&ctx, &["host3".to_string()]).await.unwrap();
    assert_eq!(ids, IdSet::decode("3").unwrap());

    let err = highlight_ranks(&ctx, &["42".to_string()]).await.unwrap_err();
    assert!(err.to_string().contains("not in set"));
}

#[tokio::test]
async fn wait_state_gates_the_report() {
    let net = TestNet::kary(1, 2).set_status(0, "degraded");
    let broker = TestBroker::start(net);
    let ctx = OverlayCtx::new(broker.client());

    let text = report(
        &ctx,
        StatusOptions {
            wait: Some("degraded".to_string()),
            ..opts()
        },
        0,
        StatusFilter::Summary,
    )
    .await;
    assert_eq!(text, "degraded\n");

    let mut out = Vec::new();
    let err = status_report(
        &ctx,
        StatusOptions {
            wait: Some("sideways".to_string()),
            ..opts()
        },
        0,
        StatusFilter::Summary,
        &mut out,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("invalid --wait state"));
}

#[tokio::test]
async fn verbose_shows_time_in_state() {
    let net = TestNet::kary(1, 2).set_duration(0, 90.0);
    let broker = TestBroker::start(net);
    let ctx = OverlayCtx::new(broker.client());

    let text = report(
        &ctx,
        StatusOptions {
            verbose: 1,
            ..opts()
        },
        0,
        StatusFilter::Summary,
    )
    .await;
    assert_eq!(text, "full for 1.5m\n");
}

#[tokio::test]
async fn errors_aggregated_by_text_with_lost_parent_group() {
    // rank 7 is lost with an error; its child 15 is behind it; rank 8 is
    // merely offline and must not be reported
    let net = TestNet::kary(16, 2)
        .set_status(0, "partial")
        .set_status(1, "partial")
        .set_status(3, "partial")
        .set_status(7, "lost")
        .set_error(7, "socket closed")
        .set_status(8, "offline");
    let broker = TestBroker::start(net);
    let ctx = OverlayCtx::new(broker.client());

    let mut out = Vec::new();
    errors_report(&ctx, Some(Duration::from_millis(200)), &mut out)
        .await
        .unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text, "host15: lost parent\nhost7: socket closed\n");
}

#[tokio::test]
async fn parentof_and_rank_resolution() {
    let broker = TestBroker::start(TestNet::kary(7, 2));
    let ctx = OverlayCtx::new(broker.client());

    assert_eq!(ctx.parent_of(5).await.unwrap(), 2);
    assert_eq!(ctx.parent_of(3).await.unwrap(), 1);
    assert!(ctx.parent_of(0).await.is_err());
    assert!(ctx.parent_of(99).await.is_err());

    assert_eq!(ctx.resolve_rank("4").await.unwrap(), 4);
    assert_eq!(ctx.resolve_rank("host6").await.unwrap(), 6);
    assert!(ctx.resolve_rank("hostile").await.is_err());
}

#[tokio::test]
async fn disconnect_goes_to_the_parent() {
    let broker = TestBroker::start(TestNet::kary(7, 2));
    let ctx = OverlayCtx::new(broker.client());

    let rank = ctx.resolve_rank("host5").await.unwrap();
    let parent = ctx.parent_of(rank).await.unwrap();
    assert_eq!(parent, 2);

    let rpc = ctx
        .handle()
        .rpc_pack(
            "overlay.disconnect-subtree",
            &serde_json::json!({ "rank": rank }),
            parent,
            flux_core::RpcFlags::empty(),
        )
        .await
        .unwrap();
    rpc.get().await.unwrap();
    assert_eq!(broker.disconnects(), vec![5]);
}
