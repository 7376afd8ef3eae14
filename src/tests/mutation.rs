use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::mutation::{Mutation, MutationError};
use crate::records::RecordStore;
use crate::sync::SyncOutcome;

struct Cluster {
    remote: Arc<FlakyStore>,
    remote_dir: tempfile::TempDir,
}

impl Cluster {
    fn seeded() -> Self {
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = FlakyStore::new(remote_dir.path());
        seed_remote(remote.as_ref(), ten_primary_chunks(), "100");
        Self { remote, remote_dir }
    }

    fn node(&self, options: NodeOptions<'_>) -> Node {
        let node = node(self.remote.clone(), options);
        node.app.reload(true);
        node
    }

    fn marker(&self) -> VersionToken {
        self.remote.read_marker().unwrap().unwrap()
    }

    fn remote_has(&self, ident: &str) -> bool {
        self.remote_dir.path().join(ident).is_file()
    }

    fn remote_list(&self, prefix: &str) -> Vec<String> {
        self.remote.list(prefix).unwrap()
    }
}

fn add_note(node: &Node, id: &str, texts: &[&str]) -> crate::mutation::MutationStatus {
    let mut metadata = note("Ward round");
    metadata.content_id = Some(Eid::from(id));
    node.app
        .mutations()
        .add_content(SourceType::UserNote, drafts(texts), metadata)
}

#[test]
fn test_add_publishes_new_generation() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());

    let status = add_note(&writer, "ward_round", &["sodium 128", "fluid restriction", "repeat labs"]);
    assert!(status.is_success(), "{}", status.message);
    assert!(!status.convergence_lagging);
    assert_eq!(status.chunks, 3);
    assert_eq!(status.content_id, Some(Eid::from("ward_round")));

    let token = status.token.unwrap();
    assert_eq!(writer.app.sync().handle().token(), Some(token.clone()));
    assert_eq!(cluster.marker(), token);
    assert!(token.parse::<u64>().unwrap() > 100);
    assert_eq!(writer.app.indexed_chunks(), 13);

    // chunk records and summary mirrored
    for n in 1..=3 {
        assert!(cluster.remote_has(&format!("processed/user_notes_chunks/ward_round_chunk{n}.json")));
    }
    let summary_path = RecordStore::summary_path(SourceType::UserNote);
    assert!(cluster.remote_has(&summary_path));
    let summary = writer.app.mutations().records().load_summary(SourceType::UserNote).unwrap();
    assert_eq!(summary.total_items, 1);
    assert_eq!(summary.total_chunks, 3);
    assert_eq!(summary.find("ward_round").unwrap().title, "Ward round");

    // another replica converges on a forced refresh
    let reader = cluster.node(NodeOptions::default());
    assert_eq!(reader.app.sync().handle().token(), Some(token));
    assert_eq!(reader.app.indexed_chunks(), 13);
}

#[test]
fn test_generated_content_ids_carry_the_type() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());

    let status = writer.app.mutations().add_content(
        SourceType::UserDrawing,
        drafts(&["sketch of the nephron"]),
        note("Nephron"),
    );
    let id = status.content_id.unwrap();
    assert!(id.starts_with("user_drawing_"), "{id}");
    assert!(writer
        .app
        .sync()
        .handle()
        .current()
        .unwrap()
        .index()
        .contains(&id.chunk_id(1)));
}

#[test]
fn test_delete_removes_every_chunk_and_record() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());
    add_note(&writer, "ward_round", &["one", "two", "three", "four"]);
    add_note(&writer, "other_note", &["keep me"]);
    assert_eq!(writer.app.indexed_chunks(), 15);

    let status = writer.app.mutations().apply(Mutation::Delete {
        content_id: Eid::from("ward_round"),
        source_type: SourceType::UserNote,
    });
    assert!(status.is_success(), "{}", status.message);
    assert_eq!(status.chunks, 4);
    assert_eq!(writer.app.indexed_chunks(), 11);

    let replica = writer.app.sync().handle().current().unwrap();
    assert!(replica.index().chunk_ids_for("ward_round").is_empty());
    assert_eq!(replica.index().chunk_ids_for("other_note").len(), 1);
    assert_eq!(cluster.marker(), status.token.unwrap());

    let prefix = RecordStore::chunk_prefix(SourceType::UserNote, &Eid::from("ward_round"));
    assert!(cluster.remote_list(&prefix).is_empty());
    assert!(writer
        .app
        .mutations()
        .records()
        .chunk_files(SourceType::UserNote, &Eid::from("ward_round"))
        .is_empty());

    let summary = writer.app.mutations().records().load_summary(SourceType::UserNote).unwrap();
    assert!(summary.find("ward_round").is_none());
    assert_eq!(summary.total_items, 1);
}

#[test]
fn test_primary_content_cannot_be_deleted() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());

    let result = writer
        .app
        .mutations()
        .try_delete(&Eid::from("part1_ch3_topic"), SourceType::Primary);
    assert!(matches!(result, Err(MutationError::Protected)));

    let status = writer
        .app
        .mutations()
        .delete_content(&Eid::from("part1_ch3_topic"), SourceType::Primary);
    assert!(!status.is_success());
    assert_eq!(status.message, "cannot delete primary corpus content");
    assert_eq!(writer.app.indexed_chunks(), 10);
    assert_eq!(cluster.marker(), VersionToken::from("100"));
}

#[test]
fn test_unknown_or_mistyped_content_is_not_found() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());
    add_note(&writer, "ward_round", &["one"]);
    let marker = cluster.marker();

    let mutations = writer.app.mutations();
    assert!(matches!(
        mutations.try_delete(&Eid::from("never_added"), SourceType::UserNote),
        Err(MutationError::NotFound(_))
    ));
    assert!(matches!(
        mutations.try_delete(&Eid::from("ward_round"), SourceType::UserAudio),
        Err(MutationError::NotFound(_))
    ));
    assert!(matches!(
        mutations.try_delete(&Eid::from("../escape"), SourceType::UserNote),
        Err(MutationError::InvalidContent(_))
    ));
    assert_eq!(cluster.marker(), marker);
    assert_eq!(writer.app.indexed_chunks(), 11);
}

#[test]
fn test_readding_an_id_regenerates_its_chunks() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());
    add_note(&writer, "ward_round", &["one", "two", "three"]);

    let status = add_note(&writer, "ward_round", &["rewritten one", "rewritten two"]);
    assert!(status.is_success(), "{}", status.message);
    assert_eq!(writer.app.indexed_chunks(), 12);

    let replica = writer.app.sync().handle().current().unwrap();
    let mut ids = replica.index().chunk_ids_for("ward_round");
    ids.sort();
    assert_eq!(ids, vec!["ward_round_chunk1", "ward_round_chunk2"]);
    assert_eq!(
        replica.index().get("ward_round_chunk1").unwrap().chunk.text,
        "rewritten one"
    );

    let prefix = RecordStore::chunk_prefix(SourceType::UserNote, &Eid::from("ward_round"));
    assert_eq!(cluster.remote_list(&prefix).len(), 2);
    let summary = writer.app.mutations().records().load_summary(SourceType::UserNote).unwrap();
    assert_eq!(summary.total_items, 1);
    assert_eq!(summary.total_chunks, 2);
}

#[test]
fn test_tokens_strictly_increase() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());

    let mut previous = 100u64;
    for n in 0..4 {
        let status = add_note(&writer, &format!("note_{n}"), &["text"]);
        let token: u64 = status.token.unwrap().parse().unwrap();
        assert!(token > previous, "{token} <= {previous}");
        previous = token;
    }
    let status = writer
        .app
        .mutations()
        .delete_content(&Eid::from("note_0"), SourceType::UserNote);
    assert!(status.token.unwrap().parse::<u64>().unwrap() > previous);
}

#[test]
fn test_interleaved_writers_build_on_each_other() {
    let cluster = Cluster::seeded();
    let first = cluster.node(NodeOptions::default());
    let second = cluster.node(NodeOptions::default());

    add_note(&first, "from_first", &["a", "b"]);
    add_note(&second, "from_second", &["c"]);

    // the second writer refreshed before editing, so nothing was lost
    assert_eq!(second.app.indexed_chunks(), 13);
    first.app.reload(true);
    assert_eq!(first.app.indexed_chunks(), 13);
    assert_eq!(first.app.sync().handle().token(), Some(cluster.marker()));
}

#[test]
fn test_embedding_failure_changes_nothing() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());
    writer.embedder.set_failing(true);

    let status = add_note(&writer, "ward_round", &["one", "two"]);
    assert!(!status.is_success());
    assert!(status.message.contains("embedding"), "{}", status.message);

    assert_eq!(writer.app.indexed_chunks(), 10);
    assert_eq!(writer.app.sync().handle().token(), Some(VersionToken::from("100")));
    assert_eq!(cluster.marker(), VersionToken::from("100"));
    assert!(writer
        .app
        .mutations()
        .records()
        .chunk_files(SourceType::UserNote, &Eid::from("ward_round"))
        .is_empty());
}

#[test]
fn test_raw_file_is_stored_and_removed() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());

    let upload = tempfile::tempdir().unwrap();
    let scan = upload.path().join("chest_xray.png");
    std::fs::write(&scan, b"\x89PNG fake image").unwrap();

    let status = writer.app.mutations().add_content(
        SourceType::UserImage,
        drafts(&["right lower lobe consolidation"]),
        ContentMetadata {
            content_id: Some(Eid::from("xray_1")),
            title: "Chest x-ray".to_string(),
            raw_file: Some(scan),
            ..Default::default()
        },
    );
    assert!(status.is_success(), "{}", status.message);

    let raw_ident = "processed/user_images/xray_1.png";
    assert!(writer.app.mutations().records().files().exists(raw_ident));
    assert!(cluster.remote_has(raw_ident));
    let summary = writer.app.mutations().records().load_summary(SourceType::UserImage).unwrap();
    let item = summary.find("xray_1").unwrap();
    assert_eq!(item.filename.as_deref(), Some("chest_xray.png"));
    assert_eq!(item.file_size, 15);

    let status = writer
        .app
        .mutations()
        .delete_content(&Eid::from("xray_1"), SourceType::UserImage);
    assert!(status.is_success(), "{}", status.message);
    assert!(!writer.app.mutations().records().files().exists(raw_ident));
    assert!(!cluster.remote_has(raw_ident));
}

fn add_image(node: &Node, id: &str, upload: &std::path::Path) -> crate::mutation::MutationStatus {
    node.app.mutations().add_content(
        SourceType::UserImage,
        drafts(&[&format!("{id} findings")]),
        ContentMetadata {
            content_id: Some(Eid::from(id)),
            title: id.to_string(),
            raw_file: Some(upload.to_path_buf()),
            ..Default::default()
        },
    )
}

#[test]
fn test_uploads_with_the_same_name_stay_apart() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());
    let files = writer.app.mutations().records().files().clone();

    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let first = first_dir.path().join("scan.png");
    let second = second_dir.path().join("scan.png");
    std::fs::write(&first, b"first scan").unwrap();
    std::fs::write(&second, b"second scan").unwrap();

    assert!(add_image(&writer, "scan_monday", &first).is_success());
    assert!(add_image(&writer, "scan_tuesday", &second).is_success());

    let monday = "processed/user_images/scan_monday.png";
    let tuesday = "processed/user_images/scan_tuesday.png";
    assert_eq!(files.read(monday).unwrap(), b"first scan");
    assert_eq!(files.read(tuesday).unwrap(), b"second scan");
    assert!(cluster.remote_has(monday) && cluster.remote_has(tuesday));

    let summary = writer.app.mutations().records().load_summary(SourceType::UserImage).unwrap();
    assert_eq!(summary.find("scan_monday").unwrap().filename.as_deref(), Some("scan.png"));
    assert_eq!(summary.find("scan_tuesday").unwrap().filename.as_deref(), Some("scan.png"));

    let status = writer
        .app
        .mutations()
        .delete_content(&Eid::from("scan_monday"), SourceType::UserImage);
    assert!(status.is_success(), "{}", status.message);
    assert!(!files.exists(monday) && !cluster.remote_has(monday));
    assert_eq!(files.read(tuesday).unwrap(), b"second scan");
    assert!(cluster.remote_has(tuesday));
}

#[test]
fn test_readding_without_a_file_drops_the_old_one() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());

    let upload = tempfile::tempdir().unwrap();
    let scan = upload.path().join("scan.jpeg");
    std::fs::write(&scan, b"jpeg").unwrap();
    assert!(add_image(&writer, "scan_a", &scan).is_success());
    let ident = "processed/user_images/scan_a.jpeg";
    assert!(cluster.remote_has(ident));

    let mut metadata = note("Scan, described");
    metadata.content_id = Some(Eid::from("scan_a"));
    let status = writer.app.mutations().add_content(
        SourceType::UserImage,
        drafts(&["described instead"]),
        metadata,
    );
    assert!(status.is_success(), "{}", status.message);
    assert!(!writer.app.mutations().records().files().exists(ident));
    assert!(!cluster.remote_has(ident));
}

#[test]
fn test_delete_leaves_ids_sharing_a_prefix_alone() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());
    add_note(&writer, "labs", &["potassium 5.9", "repeat in 4h"]);
    add_note(&writer, "labs_chunked", &["creatinine", "urea", "egfr"]);

    let status = writer
        .app
        .mutations()
        .delete_content(&Eid::from("labs"), SourceType::UserNote);
    assert!(status.is_success(), "{}", status.message);
    assert_eq!(status.chunks, 2);

    let kept = Eid::from("labs_chunked");
    let records = writer.app.mutations().records();
    assert_eq!(records.chunk_files(SourceType::UserNote, &kept).len(), 3);
    assert!(records.chunk_files(SourceType::UserNote, &Eid::from("labs")).is_empty());
    assert_eq!(
        cluster
            .remote_list(&RecordStore::chunk_prefix(SourceType::UserNote, &kept))
            .len(),
        3
    );
    assert!(!cluster.remote_has("processed/user_notes_chunks/labs_chunk1.json"));

    // regenerating one leaves the other intact too
    add_note(&writer, "labs", &["potassium 4.8"]);
    assert_eq!(records.chunk_files(SourceType::UserNote, &kept).len(), 3);
    assert_eq!(writer.app.indexed_chunks(), 14);
}

#[test]
fn test_marker_write_failure_reports_lagging() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions::default());
    let reader = cluster.node(NodeOptions::default());
    cluster.remote.fail_marker_writes(true);

    let status = add_note(&writer, "ward_round", &["one", "two"]);
    assert!(status.is_success(), "{}", status.message);
    assert!(status.convergence_lagging);

    // the writer serves its own change; others keep the old marker
    assert_eq!(writer.app.indexed_chunks(), 12);
    assert_eq!(writer.app.sync().handle().token(), status.token);
    assert_eq!(cluster.marker(), VersionToken::from("100"));

    cluster.remote.fail_marker_writes(false);
    assert_eq!(
        reader.app.reload(true).outcome,
        SyncOutcome::UpToDate {
            token: VersionToken::from("100")
        }
    );
    assert_eq!(reader.app.indexed_chunks(), 10);
}

#[test]
fn test_slow_snapshot_upload_times_out_but_converges() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions {
        upload_timeout_secs: 1,
        ..Default::default()
    });
    let reader = cluster.node(NodeOptions::default());
    cluster.remote.delay_snapshot_uploads(Duration::from_millis(1500));

    let status = add_note(&writer, "ward_round", &["one", "two"]);
    assert!(status.is_success(), "{}", status.message);
    assert!(status.convergence_lagging);
    let token = status.token.unwrap();
    assert_eq!(cluster.marker(), token);
    assert_eq!(writer.app.sync().handle().token(), Some(token.clone()));

    // marker is ahead of the snapshot until the upload lands
    let outcome = reader.app.reload(true).outcome;
    assert!(
        matches!(outcome, SyncOutcome::RemoteLagging { .. }),
        "{outcome:?}"
    );

    std::thread::sleep(Duration::from_millis(1200));
    let report = reader.app.reload(true);
    assert!(matches!(report.outcome, SyncOutcome::Refreshed { chunks: 12, .. }), "{:?}", report.outcome);
    assert_eq!(report.after, Some(token));
}

#[test]
fn test_late_snapshot_upload_never_lands_over_a_newer_one() {
    let cluster = Cluster::seeded();
    let writer = cluster.node(NodeOptions {
        upload_timeout_secs: 1,
        ..Default::default()
    });
    cluster
        .remote
        .delay_next_snapshot_upload(Duration::from_millis(2500));

    let first = add_note(&writer, "note_a", &["first note"]);
    assert!(first.is_success(), "{}", first.message);
    assert!(first.convergence_lagging);

    let second = add_note(&writer, "note_b", &["second note"]);
    assert!(second.is_success(), "{}", second.message);
    let token = second.token.unwrap();
    assert!(token.is_newer_than(&first.token.unwrap()));
    assert_eq!(cluster.marker(), token);

    // both workers are done well before this
    std::thread::sleep(Duration::from_millis(3000));

    let reader = cluster.node(NodeOptions::default());
    assert_eq!(reader.app.sync().handle().token(), Some(token));
    assert_eq!(reader.app.indexed_chunks(), 12);
    let replica = reader.app.sync().handle().current().unwrap();
    assert_eq!(replica.index().chunk_ids_for("note_a").len(), 1);
    assert_eq!(replica.index().chunk_ids_for("note_b").len(), 1);
}
