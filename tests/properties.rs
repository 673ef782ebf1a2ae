//! Property-based tests for the tensor codecs and the device-group cursors.

use proptest::prelude::*;

use kneron_plus::inference::GenericDataInferenceDesc;
use kneron_plus::layout::{self, ChannelOrderingConvert};
use kneron_plus::quantization::FactorSelector;
use kneron_plus::tensor::{
    row_major_strides, FixedPointDescriptor, QuantizationV1, Scale, SchemaVersion, ShapeInfoV1, ShapeInfoV2,
    SingleModelDescriptor,
};
use kneron_plus::transport::ScriptedTransport;
use kneron_plus::wire::{self, put_u32, HeaderStamp};
use kneron_plus::{
    DataLayout, DeviceGroup, Error, GroupConfig, ModelDescriptor, Quantization, RawNodeOutput, ShapeInfo,
    TargetChip, TensorDescriptor,
};

fn shape_strategy(max_rank: usize, max_dim: i32) -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(1..=max_dim, 1..=max_rank)
}

fn raw8_node(shape: Vec<i32>, quantization: Quantization) -> TensorDescriptor {
    let strides = row_major_strides(&shape);
    TensorDescriptor {
        index: 0,
        name: "out".into(),
        data_layout: DataLayout::Raw8B,
        shape_info: ShapeInfo::V2(ShapeInfoV2::with_row_major_onnx(shape, strides)),
        quantization,
    }
}

fn legacy_node(layout: DataLayout, [c, h, w]: [i32; 3]) -> TensorDescriptor {
    TensorDescriptor {
        index: 0,
        name: String::new(),
        data_layout: layout,
        shape_info: ShapeInfo::V1(ShapeInfoV1::identity([1, c, h, w])),
        quantization: Quantization::single(1, 0, 1.0),
    }
}

proptest! {
    #[test]
    fn element_count_is_shape_product(shape in shape_strategy(8, 4)) {
        let expected: usize = shape.iter().map(|&d| d as usize).product();
        let info = ShapeInfo::V2(ShapeInfoV2::with_row_major_onnx(shape.clone(), row_major_strides(&shape)));
        prop_assert_eq!(info.num_elements(), expected);
    }

    #[test]
    fn row_major_raw8_decodes_in_place(
        (shape, bytes) in shape_strategy(5, 4).prop_flat_map(|shape| {
            let n: usize = shape.iter().map(|&d| d as usize).product();
            (Just(shape), prop::collection::vec(any::<u8>(), n))
        })
    ) {
        let desc = raw8_node(shape.clone(), Quantization::single(0, 0, 1.0));
        let out = layout::decode_fixed(&RawNodeOutput::new(desc, &bytes), ChannelOrderingConvert::None).unwrap();
        let expected: Vec<i32> = bytes.iter().map(|&b| b as i8 as i32).collect();
        prop_assert_eq!(out.shape, shape);
        prop_assert_eq!(out.data.to_i32(), expected);
    }

    #[test]
    fn float_decode_divides_by_factor(
        bytes in prop::collection::vec(any::<u8>(), 1..64),
        radix in -4i32..8,
        scale in 0.125f32..16.0,
    ) {
        let desc = raw8_node(vec![bytes.len() as i32], Quantization::single(0, radix, scale));
        let raw = RawNodeOutput::new(desc, &bytes);
        let fixed = layout::decode_fixed(&raw, ChannelOrderingConvert::None).unwrap();
        let float = layout::decode_float(&raw, ChannelOrderingConvert::None).unwrap();
        let factor = scale * 2f32.powi(radix);
        for (f, q) in float.data.iter().zip(fixed.data.to_i32()) {
            prop_assert_eq!(*f, q as f32 / factor);
        }
    }

    #[test]
    fn channel_wise_index_follows_leading_axis(
        channels in 2usize..6,
        inner in prop::collection::vec(1i32..=4, 0..3),
    ) {
        let mut shape = vec![channels as i32];
        shape.extend(inner);
        let quant = QuantizationV1 {
            quantized_axis: 0,
            descriptors: (0..channels)
                .map(|i| FixedPointDescriptor { radix: i as i32, scale: Scale::Float32(1.0) })
                .collect(),
        };
        let selector = FactorSelector::new(&quant, &shape).unwrap();
        let total: usize = shape.iter().map(|&d| d as usize).product();
        let per_channel = total / channels;
        prop_assert_eq!(selector.axis_stride(), per_channel);
        for offset in 0..total {
            prop_assert_eq!(selector.descriptor_index(offset), offset / per_channel);
            prop_assert_eq!(selector.factor(offset).unwrap(), 2f32.powi((offset / per_channel) as i32));
        }
    }

    #[test]
    fn channel_packed_rejects_hcw_sources(c in 1i32..40, h in 1i32..4, w in 1i32..4) {
        let blocks = (c as usize).div_ceil(16);
        let bytes = vec![0u8; blocks * (h * w) as usize * 16];
        let desc = legacy_node(DataLayout::Npu1W16C8B, [c, h, w]);
        let raw = RawNodeOutput::new(desc, &bytes);

        for convert in [ChannelOrderingConvert::Hcw2Chw, ChannelOrderingConvert::Hcw2Hwc] {
            prop_assert!(matches!(layout::decode_fixed(&raw, convert), Err(Error::InvalidDataLayout(_))));
        }
        for convert in [
            ChannelOrderingConvert::None,
            ChannelOrderingConvert::Chw2Hcw,
            ChannelOrderingConvert::Chw2Hwc,
        ] {
            let out = layout::decode_fixed(&raw, convert).unwrap();
            prop_assert_eq!(out.num_elements(), (c * h * w) as usize);
        }
    }

    #[test]
    fn cursors_count_their_own_transfers(
        devices in 1usize..6,
        ops in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let transports = (0..devices).map(|_| ScriptedTransport::new()).collect();
        let mut group = DeviceGroup::new(transports, wire::PRODUCT_ID_KL730, GroupConfig::default()).unwrap();
        group.set_model(ModelDescriptor {
            target_chip: TargetChip::Kl730,
            models: vec![SingleModelDescriptor {
                id: 1,
                target_chip: TargetChip::Kl730,
                schema_version: SchemaVersion::default(),
                input_nodes: vec![legacy_node(DataLayout::Npu4W4C8B, [1, 1, 4])],
                output_nodes: vec![],
                buffer_info: vec![],
            }],
        });

        let receives = ops.iter().filter(|&&is_send| !is_send).count();
        for i in 0..receives {
            let index = i % devices;
            group.device_mut(index).unwrap().push_frame(empty_result());
        }

        let payload = [0u8; 4];
        let mut buf = vec![0u8; 256];
        let (mut sent, mut received) = (0, 0);
        for is_send in ops {
            if is_send {
                group
                    .generic_data_inference_send(&GenericDataInferenceDesc {
                        inference_number: sent as u32,
                        model_id: 1,
                        input_node_data: vec![&payload[..]],
                    })
                    .unwrap();
                sent += 1;
            } else {
                group.generic_inference_receive(&mut buf).unwrap();
                received += 1;
            }
            prop_assert_eq!(group.send_cursor(), sent % devices);
            prop_assert_eq!(group.recv_cursor(), received % devices);
        }
    }
}

fn empty_result() -> Vec<u8> {
    let mut frame = Vec::new();
    HeaderStamp {
        magic_type: wire::MAGIC_TYPE_INFERENCE_V2,
        total_size: 64,
        job_id: wire::JOB_ID_GENERIC_DATA_INFERENCE,
        ..Default::default()
    }
    .encode_into(&mut frame);
    for v in [wire::PRODUCT_ID_KL730 as u32, 0, 0, 1, 0, 0, 0, 2, 0, 0] {
        put_u32(&mut frame, v);
    }
    frame
}
