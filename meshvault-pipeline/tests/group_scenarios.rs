//! Whole-group storage scenarios

use bytes::Bytes;
use futures::StreamExt;
use meshvault_core::MeshVaultError;
use meshvault_pipeline::{PipelineConfig, RedundancyMode, StoragePipeline};
use std::time::Duration;

fn config(data_shards: usize, parity_shards: usize, auto_heal: bool) -> PipelineConfig {
    PipelineConfig {
        data_shards,
        parity_shards,
        auto_heal,
        ..PipelineConfig::default()
    }
}

fn small_stripes(auto_heal: bool) -> PipelineConfig {
    PipelineConfig {
        chunk_size: 64 * 1024,
        ..config(4, 2, auto_heal)
    }
}

fn payload(len: usize) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect::<Vec<u8>>(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_megabytes_survive_four_failures_and_heal() {
    let pipeline = StoragePipeline::simulated(config(10, 6, false), 10).unwrap();
    let data = payload(50 * 1024 * 1024);

    let manifest = pipeline
        .upload_file("dataset.bin", data.clone(), "member_0")
        .await
        .unwrap();
    assert_eq!(manifest.redundancy.mode, RedundancyMode::ErasureCoded);
    assert_eq!(manifest.stripes.len(), 13);
    assert_eq!(manifest.shard_locations.len(), 13 * 16);
    assert_eq!(manifest.size, data.len() as u64);

    for i in 6..10 {
        pipeline
            .simulate_member_failure(&format!("member_{i}"))
            .unwrap();
    }

    let status = pipeline.replication_status(&manifest.file_id).unwrap();
    assert_eq!(status.current_replication, 12);
    assert_eq!(status.target_replication, 16);
    assert!(status.is_recoverable());

    let read = pipeline.download_file(&manifest.file_id).await.unwrap();
    assert!(read == data, "degraded download differs");

    let report = pipeline.heal_now().await.unwrap();
    assert_eq!(report.stripes_repaired, 13);
    assert_eq!(report.shards_rebuilt, 13 * 4);
    assert_eq!(report.manifests_committed, 1);

    let healing = pipeline.healing_status();
    assert!(!healing.in_progress);
    assert_eq!(healing.target_replication, 16);
    assert_eq!(healing.current_replication, 16);

    let healed = pipeline.manifest(&manifest.file_id).unwrap();
    assert_eq!(healed.revision, 1);
    assert_eq!(healed.version, "1.0.0");
    let online = pipeline.online_members();
    assert!(healed
        .shard_locations
        .iter()
        .all(|loc| online.contains(&loc.member_id)));
    assert_eq!(pipeline.manifest_history(&manifest.file_id).len(), 2);

    let read = pipeline
        .download_file_from(&manifest.file_id, "member_3")
        .await
        .unwrap();
    assert!(read == data, "healed download differs");
}

#[tokio::test]
async fn background_healing_after_failures() {
    let pipeline = StoragePipeline::simulated(config(10, 6, true), 10).unwrap();
    let data = payload(300_000);
    let manifest = pipeline
        .upload_file("weights.safetensors", data.clone(), "member_1")
        .await
        .unwrap();
    assert_eq!(manifest.mime_type, "application/vnd.meshvault.model");

    for i in [2, 5, 7, 9] {
        pipeline
            .simulate_member_failure(&format!("member_{i}"))
            .unwrap();
    }
    assert!(pipeline.healing_status().in_progress);

    let status = pipeline
        .wait_for_healing(Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(!status.in_progress);
    assert_eq!(status.current_replication, 16);
    assert!(status.last_error.is_none());
    assert_eq!(
        pipeline
            .replication_status(&manifest.file_id)
            .unwrap()
            .current_replication,
        16
    );
    assert_eq!(pipeline.download_file(&manifest.file_id).await.unwrap(), data);
}

#[tokio::test]
async fn healing_updates_are_observable() {
    let pipeline = StoragePipeline::simulated(small_stripes(false), 6).unwrap();
    let manifest = pipeline
        .upload_file("log.txt", payload(100_000), "member_0")
        .await
        .unwrap();
    let mut updates = pipeline.healing_updates();
    // The current value is yielded first
    assert!(!updates.next().await.unwrap().in_progress);

    pipeline.simulate_member_failure("member_4").unwrap();
    pipeline.heal_now().await.unwrap();

    let latest = updates.next().await.unwrap();
    assert!(!latest.in_progress);
    assert_eq!(latest.current_replication, 6);
    assert_eq!(latest.shards_rebuilt, manifest.stripes.len());
}

#[tokio::test]
async fn two_members_keep_full_copies() {
    let pipeline = StoragePipeline::simulated(config(10, 6, false), 2).unwrap();
    let data = payload(200_000);
    let manifest = pipeline
        .upload_file("notes.md", data.clone(), "member_0")
        .await
        .unwrap();

    assert_eq!(manifest.redundancy.mode, RedundancyMode::FullReplication);
    assert_eq!(
        (manifest.redundancy.data_shards, manifest.redundancy.parity_shards),
        (1, 1)
    );
    assert_eq!(manifest.mime_type, "text/markdown");
    for stripe in &manifest.stripes {
        let holders: Vec<&str> = manifest
            .locations_for(stripe.chunk_index)
            .iter()
            .map(|loc| loc.member_id.as_str())
            .collect();
        assert_eq!(holders, vec!["member_0", "member_1"]);
    }

    pipeline.simulate_member_failure("member_1").unwrap();
    assert_eq!(
        pipeline
            .download_file_from(&manifest.file_id, "member_0")
            .await
            .unwrap(),
        data
    );
    assert!(matches!(
        pipeline.download_file_from(&manifest.file_id, "member_1").await,
        Err(MeshVaultError::NodeUnavailable(_))
    ));

    pipeline.restore_member("member_1").unwrap();
    pipeline.simulate_member_failure("member_0").unwrap();
    assert_eq!(
        pipeline
            .download_file_from(&manifest.file_id, "member_1")
            .await
            .unwrap(),
        data
    );
}

#[tokio::test]
async fn partitions_accept_writes_and_merge() {
    let pipeline = StoragePipeline::simulated(small_stripes(false), 6).unwrap();
    pipeline
        .simulate_partition(&[
            vec!["member_0", "member_1", "member_2"],
            vec!["member_3", "member_4", "member_5"],
        ])
        .unwrap();

    let left_data = payload(150_000);
    let right_data = payload(90_000);
    let left = pipeline
        .upload_file("left.bin", left_data.clone(), "member_0")
        .await
        .unwrap();
    let right = pipeline
        .upload_file("right.bin", right_data.clone(), "member_4")
        .await
        .unwrap();

    assert!(left
        .shard_locations
        .iter()
        .all(|loc| ["member_0", "member_1", "member_2"].contains(&loc.member_id.as_str())));
    assert!(right
        .shard_locations
        .iter()
        .all(|loc| ["member_3", "member_4", "member_5"].contains(&loc.member_id.as_str())));

    assert!(matches!(
        pipeline.download_file_from(&left.file_id, "member_5").await,
        Err(MeshVaultError::InsufficientShards { .. })
    ));

    let report = pipeline.heal_partition().await.unwrap();
    assert_eq!(report.store.partitions_dissolved, 2);
    assert_eq!(report.repair.files_scanned, 2);

    for member in pipeline.members() {
        assert_eq!(
            pipeline.download_file_from(&left.file_id, &member).await.unwrap(),
            left_data
        );
        assert_eq!(
            pipeline.download_file_from(&right.file_id, &member).await.unwrap(),
            right_data
        );
    }
}

#[tokio::test]
async fn updates_create_linked_versions() {
    let pipeline = StoragePipeline::simulated(small_stripes(false), 4).unwrap();
    let first = pipeline
        .upload_file("report.json", payload(70_000), "member_0")
        .await
        .unwrap();
    let second_data = payload(130_000);
    let second = pipeline
        .update_file(&first.file_id, second_data.clone(), "member_2")
        .await
        .unwrap();

    assert_eq!(second.file_id, first.file_id);
    assert_eq!(second.version, "1.0.1");
    assert_eq!(second.previous_version.as_deref(), Some("1.0.0"));
    assert_eq!(second.uploader, "member_2");
    assert_eq!(second.file_name, "report.json");

    assert_eq!(pipeline.download_file(&first.file_id).await.unwrap(), second_data);
    assert_eq!(pipeline.manifest_history(&first.file_id).len(), 2);
    assert_eq!(
        pipeline.find_by_name("report.json").unwrap().version,
        "1.0.1"
    );
    assert_eq!(pipeline.list_files().len(), 1);

    let json = second.to_json().unwrap();
    assert!(json.contains("\"previousVersion\": \"1.0.0\""));
}

#[tokio::test]
async fn streaming_matches_buffered_download() {
    let pipeline = StoragePipeline::simulated(
        PipelineConfig {
            stream_chunk_size: 16 * 1024,
            ..small_stripes(false)
        },
        5,
    )
    .unwrap();
    let data = payload(333_333);
    let manifest = pipeline
        .upload_file("video.bin", data.clone(), "member_0")
        .await
        .unwrap();
    pipeline.simulate_member_failure("member_2").unwrap();

    let mut stream = pipeline
        .download_stream(&manifest.file_id, "member_4")
        .unwrap();
    let mut streamed = Vec::with_capacity(data.len());
    let mut pieces = 0;
    while let Some(piece) = stream.next().await {
        let piece = piece.unwrap();
        assert!(piece.len() <= 16 * 1024);
        streamed.extend_from_slice(&piece);
        pieces += 1;
    }
    assert_eq!(streamed.len(), data.len());
    assert!(streamed == data.to_vec());
    assert!(pieces >= data.len() / (16 * 1024));
}
