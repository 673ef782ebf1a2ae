use kneron_plus::checkpoint::CheckpointPayload;
use kneron_plus::inference::GenericDataInferenceDesc;
use kneron_plus::tensor::{SchemaVersion, ShapeInfoV1, SingleModelDescriptor};
use kneron_plus::transport::Reply;
use kneron_plus::wire::{self, put_u32, HeaderStamp};
use kneron_plus::{
    DataLayout, DeviceGroup, Error, GroupConfig, ModelDescriptor, Quantization, ScriptedTransport, ShapeInfo,
    TargetChip, TensorDescriptor,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn model(inputs: u32) -> ModelDescriptor {
    let input = |index| TensorDescriptor {
        index,
        name: format!("input_{}", index),
        data_layout: DataLayout::Npu1W16C8B,
        shape_info: ShapeInfo::V1(ShapeInfoV1::identity([1, 3, 4, 4])),
        quantization: Quantization::single(1, 0, 1.0),
    };
    ModelDescriptor {
        target_chip: TargetChip::Kl730,
        models: vec![SingleModelDescriptor {
            id: 211,
            target_chip: TargetChip::Kl730,
            schema_version: SchemaVersion::default(),
            input_nodes: (0..inputs).map(input).collect(),
            output_nodes: vec![],
            buffer_info: vec![],
        }],
    }
}

fn group(devices: usize, config: GroupConfig) -> DeviceGroup<ScriptedTransport> {
    init();
    let transports = (0..devices).map(|_| ScriptedTransport::new()).collect();
    let mut group = DeviceGroup::new(transports, wire::PRODUCT_ID_KL730, config).unwrap();
    group.set_model(model(1));
    group
}

/// A v2 result frame with no output nodes.
fn empty_result(inference_number: u32, is_last_crop: bool, job_id: u32) -> Vec<u8> {
    let mut frame = Vec::new();
    HeaderStamp {
        magic_type: wire::MAGIC_TYPE_INFERENCE_V2,
        total_size: 64,
        job_id,
        ..Default::default()
    }
    .encode_into(&mut frame);
    for v in [wire::PRODUCT_ID_KL730 as u32, inference_number, 0, is_last_crop as u32, 0, 0, 0] {
        put_u32(&mut frame, v);
    }
    for v in [2, 0, 0] {
        put_u32(&mut frame, v);
    }
    frame
}

fn data_request(payload: &[u8]) -> GenericDataInferenceDesc<'_> {
    GenericDataInferenceDesc {
        inference_number: 1,
        model_id: 211,
        input_node_data: vec![payload],
    }
}

#[test]
fn cursors_move_independently() {
    let mut g = group(3, GroupConfig::default());
    let payload = [0u8; 48];
    for _ in 0..4 {
        g.generic_data_inference_send(&data_request(&payload)).unwrap();
    }
    assert_eq!(g.send_cursor(), 1);
    assert_eq!(g.recv_cursor(), 0);
    assert_eq!(g.device(0).unwrap().written.len(), 4);
    assert_eq!(g.device(1).unwrap().written.len(), 2);

    g.device_mut(0)
        .unwrap()
        .push_frame(empty_result(1, true, wire::JOB_ID_GENERIC_DATA_INFERENCE));
    let mut buf = vec![0u8; 1024];
    g.generic_data_inference_receive(&mut buf).unwrap();
    assert_eq!(g.recv_cursor(), 1);
    assert_eq!(g.send_cursor(), 1);
}

#[test]
fn oversized_request_writes_nothing() {
    let config = GroupConfig {
        input_buffer_size: 64,
        ..Default::default()
    };
    let mut g = group(2, config);
    let payload = [0u8; 64];
    assert!(matches!(
        g.generic_data_inference_send(&data_request(&payload)),
        Err(Error::PayloadTooLarge { size: 100, limit: 64 })
    ));
    assert!(g.device(0).unwrap().written.is_empty());
    assert_eq!(g.send_cursor(), 0);
}

#[test]
fn failed_write_keeps_send_cursor() {
    let mut g = group(2, GroupConfig::default());
    g.device_mut(0).unwrap().fail_write(1);
    let payload = [1u8; 8];
    assert!(matches!(
        g.generic_data_inference_send(&data_request(&payload)),
        Err(Error::TransportFailure(_))
    ));
    assert_eq!(g.send_cursor(), 0);

    g.generic_data_inference_send(&data_request(&payload)).unwrap();
    assert_eq!(g.send_cursor(), 1);
}

#[test]
fn rejected_stamp_keeps_receive_cursor() {
    let mut g = group(2, GroupConfig::default());
    let mut bogus = empty_result(1, true, wire::JOB_ID_GENERIC_DATA_INFERENCE);
    bogus[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    g.device_mut(0).unwrap().push_frame(bogus);

    let mut buf = vec![0u8; 1024];
    assert!(matches!(
        g.generic_inference_receive(&mut buf),
        Err(Error::BadHeaderStamp { magic: 0xDEAD_BEEF })
    ));
    assert_eq!(g.recv_cursor(), 0);
}

#[test]
fn device_status_is_passed_through() {
    let mut g = group(1, GroupConfig::default());
    let mut frame = empty_result(1, true, wire::JOB_ID_GENERIC_DATA_INFERENCE);
    frame[12..16].copy_from_slice(&27u32.to_le_bytes());
    g.device_mut(0).unwrap().push_frame(frame);

    let mut buf = vec![0u8; 1024];
    assert!(matches!(
        g.generic_inference_receive(&mut buf),
        Err(Error::DeviceReportedStatus(27))
    ));
}

#[test]
fn multi_crop_results_come_from_one_device() {
    let mut g = group(2, GroupConfig::default());
    {
        let dev = g.device_mut(0).unwrap();
        for last in [false, false, true] {
            dev.push_frame(empty_result(5, last, wire::JOB_ID_GENERIC_IMAGE_INFERENCE));
        }
    }
    g.device_mut(1)
        .unwrap()
        .push_frame(empty_result(6, true, wire::JOB_ID_GENERIC_IMAGE_INFERENCE));

    let mut buf = vec![0u8; 1024];
    let numbers: Vec<u32> = (0..4)
        .map(|_| g.generic_image_inference_receive(&mut buf).unwrap().inference_number)
        .collect();
    assert_eq!(numbers, vec![5, 5, 5, 6]);
    assert_eq!(g.recv_cursor(), 0);
}

#[test]
fn timeout_is_retryable() {
    let mut g = group(2, GroupConfig::default());
    g.device_mut(0)
        .unwrap()
        .push_reply(Reply::Timeout)
        .push_frame(empty_result(1, true, wire::JOB_ID_GENERIC_DATA_INFERENCE));

    let mut buf = vec![0u8; 1024];
    let err = g.generic_inference_receive(&mut buf).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(g.generic_inference_receive(&mut buf).unwrap().inference_number, 1);
    assert_eq!(g.recv_cursor(), 1);
}

#[test]
fn missing_model_comes_before_count_check() {
    let mut g = group(1, GroupConfig::default());
    let payload = [0u8; 4];
    let desc = GenericDataInferenceDesc {
        inference_number: 0,
        model_id: 99,
        input_node_data: vec![&payload[..]; 3],
    };
    assert!(matches!(g.generic_data_inference_send(&desc), Err(Error::ModelNotLoaded(99))));
}

#[test]
fn kl730_accepts_more_than_five_inputs() {
    let config = GroupConfig {
        input_buffer_count: 8,
        ..Default::default()
    };
    let mut g = group(1, config);
    g.set_model(model(7));
    let payload = [0u8; 4];
    let desc = GenericDataInferenceDesc {
        inference_number: 0,
        model_id: 211,
        input_node_data: vec![&payload[..]; 7],
    };
    g.generic_data_inference_send(&desc).unwrap();
    assert_eq!(g.device(0).unwrap().written.len(), 14);
}

#[test]
fn checkpoint_stream_ends_with_header_only_frame() {
    let mut g = group(1, GroupConfig::default());
    let mut end = Vec::new();
    HeaderStamp {
        magic_type: wire::MAGIC_TYPE_CHECKPOINT_DATA_V2,
        total_size: 24,
        ..Default::default()
    }
    .encode_into(&mut end);
    g.device_mut(0).unwrap().push_frame(end);

    assert_eq!(g.receive_checkpoint().unwrap(), CheckpointPayload::End);
    assert_eq!(g.recv_cursor(), 0);
}
