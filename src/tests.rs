#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::klv::RecordHeader;
    use crate::{
        is_valid_gpmf, Channel, FourCC, GpmfError, GpmfWriter, SampleType, StoreFlags,
        DEVICE_ID_PREFORMATTED,
    };

    /// One record of a parsed payload, flattened with its nest depth.
    #[derive(Debug, Clone)]
    struct Rec {
        key: FourCC,
        type_code: u8,
        sample_size: u8,
        repeat: u16,
        depth: usize,
        data: Vec<u8>,
    }

    fn walk(buf: &[u8], depth: usize, out: &mut Vec<Rec>) {
        let mut pos = 0;
        while pos + 4 <= buf.len() {
            if buf[pos..pos + 4] == [0, 0, 0, 0] {
                pos += 4;
                continue;
            }
            let Some(hdr) = RecordHeader::peek(buf, pos) else {
                break;
            };
            let packed = hdr.packed_size().min(buf.len().saturating_sub(pos + 8));
            out.push(Rec {
                key: hdr.key,
                type_code: hdr.type_code,
                sample_size: hdr.sample_size,
                repeat: hdr.repeat,
                depth,
                data: buf[pos + 8..pos + 8 + packed].to_vec(),
            });
            if hdr.type_code == 0 && pos + 8 + hdr.data_size() <= buf.len() {
                walk(&buf[pos + 8..pos + 8 + hdr.data_size()], depth + 1, out);
            }
            pos += hdr.record_size();
        }
    }

    fn parse(buf: &[u8]) -> Vec<Rec> {
        let mut out = Vec::new();
        walk(buf, 0, &mut out);
        out
    }

    fn find<'a>(recs: &'a [Rec], key: &[u8; 4]) -> Option<&'a Rec> {
        recs.iter().find(|r| r.key == FourCC(*key))
    }

    fn find_all<'a>(recs: &'a [Rec], key: &[u8; 4]) -> Vec<&'a Rec> {
        recs.iter().filter(|r| r.key == FourCC(*key)).collect()
    }

    fn u32_of(rec: &Rec) -> u32 {
        u32::from_be_bytes([rec.data[0], rec.data[1], rec.data[2], rec.data[3]])
    }

    fn i16_samples(rec: &Rec) -> Vec<i16> {
        rec.data
            .chunks_exact(2)
            .map(|c| i16::from_be_bytes([c[0], c[1]]))
            .collect()
    }

    fn ne_i16(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn ne_u16(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn minimal_accelerometer_capture() {
        let writer = GpmfWriter::new();
        let accl = writer
            .stream_open(Channel::Timed, Some(1), "MyCamera", None, 8192)
            .unwrap();

        accl.store(
            FourCC(*b"STNM"),
            SampleType::Ascii,
            1,
            5,
            b"Accel",
            StoreFlags::STICKY,
        )
        .unwrap();
        for xyz in [[1_i16, 2, 3], [4, 5, 6], [7, 8, 9]] {
            accl.store(
                FourCC(*b"ACCL"),
                SampleType::SignedShort,
                6,
                1,
                &ne_i16(&xyz),
                StoreFlags::NONE,
            )
            .unwrap();
        }

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        assert!(is_valid_gpmf(payload, true));

        let recs = parse(payload);
        assert_eq!(recs[0].key, FourCC::DEVC);

        let dvid = find(&recs, b"DVID").unwrap();
        assert_eq!(dvid.type_code, b'L');
        assert_eq!(u32_of(dvid), 1);

        let dvnm = find(&recs, b"DVNM").unwrap();
        assert_eq!(&dvnm.data, b"MyCamera");

        let stnm = find(&recs, b"STNM").unwrap();
        assert_eq!(&stnm.data, b"Accel");
        assert_eq!(stnm.depth, 2, "stream declarations nest under DEVC/STRM");

        // three appends of the same key coalesced into one record
        let accl_rec = find(&recs, b"ACCL").unwrap();
        assert_eq!(accl_rec.type_code, b's');
        assert_eq!(accl_rec.sample_size, 6);
        assert_eq!(accl_rec.repeat, 3);
        assert_eq!(i16_samples(accl_rec), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let tsmp = find(&recs, b"TSMP").unwrap();
        assert_eq!(u32_of(tsmp), 3);
    }

    #[test]
    fn sticky_updates_replace_not_duplicate() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();
        let mut out = vec![0_u8; 16384];

        strm.store(
            FourCC(*b"SCAL"),
            SampleType::UnsignedLong,
            4,
            1,
            &100_u32.to_ne_bytes(),
            StoreFlags::STICKY,
        )
        .unwrap();
        strm.store(
            FourCC(*b"GYRO"),
            SampleType::SignedShort,
            2,
            1,
            &ne_i16(&[7]),
            StoreFlags::NONE,
        )
        .unwrap();

        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        let scal = find_all(&recs, b"SCAL");
        assert_eq!(scal.len(), 1);
        assert_eq!(u32_of(scal[0]), 100);

        strm.store(
            FourCC(*b"SCAL"),
            SampleType::UnsignedLong,
            4,
            1,
            &200_u32.to_ne_bytes(),
            StoreFlags::STICKY,
        )
        .unwrap();
        strm.store(
            FourCC(*b"GYRO"),
            SampleType::SignedShort,
            2,
            1,
            &ne_i16(&[8]),
            StoreFlags::NONE,
        )
        .unwrap();

        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        let scal = find_all(&recs, b"SCAL");
        assert_eq!(scal.len(), 1, "second drain still has exactly one SCAL");
        assert_eq!(u32_of(scal[0]), 200);
    }

    #[test]
    fn sticky_resize_keeps_single_copy() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();
        let mut out = vec![0_u8; 16384];

        strm.store(FourCC(*b"STNM"), SampleType::Ascii, 1, 3, b"abc", StoreFlags::STICKY)
            .unwrap();
        strm.store(FourCC(*b"SIUN"), SampleType::Ascii, 1, 4, b"m/s2", StoreFlags::STICKY)
            .unwrap();
        // longer replacement forces a splice and re-insert
        strm.store(
            FourCC(*b"STNM"),
            SampleType::Ascii,
            1,
            11,
            b"longer name",
            StoreFlags::STICKY,
        )
        .unwrap();
        strm.store(
            FourCC(*b"DATA"),
            SampleType::UnsignedByte,
            1,
            1,
            &[1],
            StoreFlags::NONE,
        )
        .unwrap();

        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        assert!(is_valid_gpmf(payload, true));
        let recs = parse(payload);
        let stnm = find_all(&recs, b"STNM");
        assert_eq!(stnm.len(), 1);
        assert_eq!(&stnm[0].data, b"longer name");
        assert_eq!(&find(&recs, b"SIUN").unwrap().data, b"m/s2");
    }

    #[test]
    fn accumulate_is_linear() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();

        for v in [5_u32, 17, 20] {
            strm.store(
                FourCC(*b"CNTR"),
                SampleType::UnsignedLong,
                4,
                1,
                &v.to_ne_bytes(),
                StoreFlags::STICKY_ACCUMULATE,
            )
            .unwrap();
        }
        strm.store(
            FourCC(*b"DATA"),
            SampleType::UnsignedByte,
            1,
            1,
            &[0],
            StoreFlags::NONE,
        )
        .unwrap();

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        let cntr = find_all(&recs, b"CNTR");
        assert_eq!(cntr.len(), 1);
        assert_eq!(u32_of(cntr[0]), 42);
    }

    #[test]
    fn idle_stream_counts_empty_payloads() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();
        let mut out = vec![0_u8; 16384];

        strm.store(
            FourCC(*b"ACCL"),
            SampleType::SignedShort,
            2,
            1,
            &ne_i16(&[3]),
            StoreFlags::NONE,
        )
        .unwrap();
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        assert!(find(&parse(payload), b"EMPT").is_none());

        // no producer activity before the second drain
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        assert!(is_valid_gpmf(payload, true));
        let recs = parse(payload);
        let empt = find(&recs, b"EMPT").unwrap();
        assert_eq!(u32_of(empt), 1);

        // the idle stream still shows its last key, with zero samples
        let marker = find(&recs, b"ACCL").unwrap();
        assert_eq!(marker.repeat, 0);
        assert_eq!(marker.type_code, b's');

        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        assert_eq!(u32_of(find(&recs, b"EMPT").unwrap()), 2);
    }

    #[test]
    fn sorted_floats_emit_ascending() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();

        for v in [5.0_f32, 1.0, 3.0, 2.0, 4.0] {
            strm.store(
                FourCC(*b"XXXX"),
                SampleType::Float,
                4,
                1,
                &v.to_ne_bytes(),
                StoreFlags::SORTED,
            )
            .unwrap();
        }

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        assert!(is_valid_gpmf(payload, true));
        let recs = parse(payload);
        let xxxx = find(&recs, b"XXXX").unwrap();
        assert_eq!(xxxx.repeat, 5);
        let values: Vec<f32> = xxxx
            .data
            .chunks_exact(4)
            .map(|c| f32::from_bits(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn grouped_records_never_coalesce() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();

        for frame in [[1_i16, 1], [2, 2]] {
            strm.store(
                FourCC(*b"FACE"),
                SampleType::SignedShort,
                4,
                1,
                &ne_i16(&frame),
                StoreFlags::GROUPED,
            )
            .unwrap();
        }

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        assert_eq!(find_all(&recs, b"FACE").len(), 2);
        // grouped payloads count one sample per store
        assert_eq!(u32_of(find(&recs, b"TSMP").unwrap()), 2);
    }

    #[test]
    fn session_reduction_averages_windows() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 32768)
            .unwrap();

        let values: Vec<u16> = (0..1000).collect();
        strm.store(
            FourCC(*b"GYRO"),
            SampleType::UnsignedShort,
            2,
            1000,
            &ne_u16(&values),
            StoreFlags::NONE,
        )
        .unwrap();

        let mut out = vec![0_u8; 65536];
        let (payload, session) = writer
            .get_payload_and_session(Channel::Timed, &mut out, 100)
            .unwrap();
        assert!(is_valid_gpmf(payload, true));
        assert!(is_valid_gpmf(session, true));

        let full = parse(payload);
        assert_eq!(find(&full, b"GYRO").unwrap().repeat, 1000);

        let recs = parse(session);
        let gyro = find(&recs, b"GYRO").unwrap();
        assert_eq!(gyro.repeat, 100);
        let out_values: Vec<u16> = gyro
            .data
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        // first window is one sample short of the phase, then steady
        // ten-sample windows averaged with integer division
        assert_eq!(out_values[0], 4);
        for (k, v) in out_values.iter().enumerate().skip(1) {
            assert_eq!(*v, (10 * k + 3) as u16, "window {k}");
        }

        // sample counters are dropped from the session variant
        assert!(find(&recs, b"TSMP").is_none());
        assert!(find(&recs, b"EMPT").is_none());
    }

    #[test]
    fn quantized_stream_compresses_and_falls_back() {
        use rand::{Rng, SeedableRng};

        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 32768)
            .unwrap();
        strm.store(
            FourCC(*b"QUAN"),
            SampleType::UnsignedLong,
            4,
            1,
            &1_u32.to_ne_bytes(),
            StoreFlags::STICKY,
        )
        .unwrap();

        // smooth ramp: must compress
        let values: Vec<u16> = (0..500).map(|i| (i * 2) as u16).collect();
        strm.store(
            FourCC(*b"SnrC"),
            SampleType::UnsignedShort,
            2,
            500,
            &ne_u16(&values),
            StoreFlags::NONE,
        )
        .unwrap();
        let mut out = vec![0_u8; 65536];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        let snrc = find(&recs, b"SnrC").unwrap();
        assert_eq!(snrc.type_code, b'#');

        // high entropy: the compressor must bail out and copy verbatim
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let noise: Vec<u16> = (0..500).map(|_| rng.gen()).collect();
        strm.store(
            FourCC(*b"SnrC"),
            SampleType::UnsignedShort,
            2,
            500,
            &ne_u16(&noise),
            StoreFlags::NONE,
        )
        .unwrap();
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        let snrc = find(&recs, b"SnrC").unwrap();
        assert_eq!(snrc.type_code, b'S', "type byte unchanged on fallback");
        let stored: Vec<u16> = snrc
            .data
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(stored, noise, "fallback preserves the original bytes");
    }

    #[test]
    fn aperiodic_group_commits_as_one_nest() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();

        strm.aperiodic_begin(FourCC(*b"FACE")).unwrap();
        strm.aperiodic_store(
            FourCC(*b"FCNM"),
            SampleType::SignedShort,
            4,
            1,
            &ne_i16(&[10, 20]),
        )
        .unwrap();
        strm.aperiodic_store(
            FourCC(*b"FCNM"),
            SampleType::SignedShort,
            4,
            1,
            &ne_i16(&[30, 40]),
        )
        .unwrap();
        strm.aperiodic_end(FourCC(*b"FACE")).unwrap();

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        assert!(is_valid_gpmf(payload, true));
        let recs = parse(payload);

        let face = find(&recs, b"FACE").unwrap();
        assert_eq!(face.type_code, 0, "the group commits as a nest");
        let face_depth = face.depth;

        // the group wraps its tick pair and the stored entries
        let tick = find(&recs, b"TICK").unwrap();
        assert_eq!(tick.depth, face_depth + 1);
        assert!(find(&recs, b"TOCK").is_some());
        let fcnm = find(&recs, b"FCNM").unwrap();
        assert_eq!(fcnm.repeat, 2);
        assert_eq!(i16_samples(fcnm), vec![10, 20, 30, 40]);

        // each aperiodic store counts as one sample
        assert_eq!(u32_of(find(&recs, b"TSMP").unwrap()), 2);
    }

    #[test]
    fn stamped_stores_log_and_dejitter() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();

        // perfectly linear stamps: the fitted intercept is the first one
        for i in 0..8_u64 {
            strm.store_stamped(
                FourCC(*b"GPS5"),
                SampleType::UnsignedLong,
                4,
                1,
                &(i as u32).to_ne_bytes(),
                StoreFlags::NONE,
                1_000 + i * 500,
            )
            .unwrap();
        }

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        let stmp = find(&recs, b"STMP").unwrap();
        assert_eq!(stmp.type_code, b'J');
        let stamp = u64::from_be_bytes(stmp.data[0..8].try_into().unwrap());
        assert_eq!(stamp, 1_000);
    }

    #[test]
    fn store_all_timestamps_emits_stps() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();

        for ts in [111_u64, 222] {
            strm.store_stamped(
                FourCC(*b"GPS5"),
                SampleType::UnsignedLong,
                4,
                1,
                &7_u32.to_ne_bytes(),
                StoreFlags::STORE_ALL_TIMESTAMPS,
                ts,
            )
            .unwrap();
        }

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        let stps = find(&recs, b"STPS").unwrap();
        assert_eq!(stps.repeat, 2, "per-write stamps coalesce into one array");
        assert_eq!(
            u64::from_be_bytes(stps.data[0..8].try_into().unwrap()),
            111
        );
        assert_eq!(
            u64::from_be_bytes(stps.data[8..16].try_into().unwrap()),
            222
        );
    }

    #[test]
    fn settings_channel_skips_sample_counting() {
        let writer = GpmfWriter::new();
        let global = writer
            .stream_open(Channel::Settings, Some(1), "global", None, 8192)
            .unwrap();

        global
            .store(
                FourCC(*b"VMOD"),
                SampleType::Ascii,
                1,
                5,
                b"1080p",
                StoreFlags::NONE,
            )
            .unwrap();

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Settings, &mut out).unwrap();
        let recs = parse(payload);
        assert!(find(&recs, b"VMOD").is_some());
        assert!(find(&recs, b"TSMP").is_none());
    }

    #[test]
    fn preformatted_payloads_remultiplex() {
        fn rec(key: &[u8; 4], type_code: u8, sample_size: u8, repeat: u16, data: &[u8]) -> Vec<u8> {
            let mut buf = RecordHeader::new(FourCC(*key), type_code, sample_size, repeat)
                .to_bytes()
                .to_vec();
            buf.extend_from_slice(data);
            buf.resize(8 + crate::klv::align4(data.len()), 0);
            buf
        }

        // a fully formed external DEVC tree
        let mut strm_data = rec(b"STNM", b'c', 1, 5, b"Remot");
        strm_data.extend(rec(b"TSMP", b'L', 4, 1, &9_u32.to_be_bytes()));
        strm_data.extend(rec(
            b"BTNS",
            b'S',
            2,
            3,
            &[0, 1, 0, 2, 0, 3],
        ));
        let mut devc_data = rec(b"DVID", b'L', 4, 1, &55_u32.to_be_bytes());
        devc_data.extend(rec(b"DVNM", b'c', 1, 3, b"Ext"));
        devc_data.extend(rec(b"STRM", 0, 4, (strm_data.len() / 4) as u16, &strm_data));
        let tree = rec(b"DEVC", 0, 4, (devc_data.len() / 4) as u16, &devc_data);

        let writer = GpmfWriter::new();
        let parent = writer
            .stream_open(
                Channel::Timed,
                Some(DEVICE_ID_PREFORMATTED),
                "extern",
                None,
                16384,
            )
            .unwrap();

        parent
            .store(
                FourCC::GPMF,
                SampleType::Nest,
                1,
                tree.len() as u32,
                &tree,
                StoreFlags::NONE,
            )
            .unwrap();

        let mut out = vec![0_u8; 32768];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        assert!(is_valid_gpmf(payload, true));
        let recs = parse(payload);

        // the synthetic sub-stream carries the external device id with
        // the remux marker bit
        let dvid = find(&recs, b"DVID").unwrap();
        assert_eq!(u32_of(dvid), 55 | 0x01000000);
        assert_eq!(&find(&recs, b"STNM").unwrap().data, b"Remot");

        let btns = find(&recs, b"BTNS").unwrap();
        assert_eq!(btns.repeat, 3);

        // the input counter was dropped and re-synthesized from the replay
        assert_eq!(u32_of(find(&recs, b"TSMP").unwrap()), 3);

        // a second push routes to the same sub-stream and accumulates
        parent
            .store(
                FourCC::GPMF,
                SampleType::Nest,
                1,
                tree.len() as u32,
                &tree,
                StoreFlags::NONE,
            )
            .unwrap();
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        assert_eq!(find_all(&recs, b"DVNM").len(), 1, "one sub-stream, not two");
        assert_eq!(find(&recs, b"BTNS").unwrap().repeat, 3);
    }

    #[test]
    fn add_tick_seeds_payload_tick() {
        // make sure the millisecond tick is non-zero by the time we store
        crate::tick::tick_ms();
        std::thread::sleep(Duration::from_millis(3));

        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();

        strm.store(
            FourCC(*b"ACCL"),
            SampleType::SignedShort,
            2,
            1,
            &ne_i16(&[1]),
            StoreFlags::ADD_TICK,
        )
        .unwrap();

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        let ticks = find_all(&recs, b"TICK");
        assert!(!ticks.is_empty());
        assert!(ticks.iter().any(|t| u32_of(t) > 0));
    }

    #[test]
    fn drain_errors() {
        let writer = GpmfWriter::new();
        let mut out = vec![0_u8; 16384];
        assert_eq!(
            writer.get_payload(Channel::Timed, &mut out).unwrap_err(),
            GpmfError::EmptyData
        );

        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();
        strm.store(
            FourCC(*b"DATA"),
            SampleType::UnsignedByte,
            1,
            1,
            &[1],
            StoreFlags::NONE,
        )
        .unwrap();

        let mut tiny = vec![0_u8; 8];
        assert_eq!(
            writer.get_payload(Channel::Timed, &mut tiny).unwrap_err(),
            GpmfError::Memory
        );

        // estimate covers the real payload
        let estimate = writer.estimate_buffer_size(Channel::Timed, 0);
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        assert!(estimate >= payload.len());
    }

    #[test]
    fn store_errors() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 0)
            .unwrap();

        // minimum-size buffer: a 2000 byte record cannot fit
        let big = vec![0_u8; 2000];
        assert_eq!(
            strm.store(
                FourCC(*b"BIGB"),
                SampleType::UnsignedByte,
                1,
                2000,
                &big,
                StoreFlags::NONE
            )
            .unwrap_err(),
            GpmfError::Memory
        );

        // offered buffers below the region overhead are rejected
        assert!(writer
            .stream_open(Channel::Timed, None, "tiny", Some(vec![0_u8; 64]), 0)
            .is_err());

        let clone = strm.clone();
        writer.stream_close(strm);
        assert_eq!(
            clone
                .store(
                    FourCC(*b"DATA"),
                    SampleType::UnsignedByte,
                    1,
                    1,
                    &[1],
                    StoreFlags::NONE
                )
                .unwrap_err(),
            GpmfError::Device
        );
    }

    #[test]
    fn streams_order_by_device_id() {
        let writer = GpmfWriter::new();
        let b = writer
            .stream_open(Channel::Timed, Some(9), "second", None, 8192)
            .unwrap();
        let a = writer
            .stream_open(Channel::Timed, Some(2), "first", None, 8192)
            .unwrap();

        for strm in [&a, &b] {
            strm.store(
                FourCC(*b"DATA"),
                SampleType::UnsignedByte,
                1,
                1,
                &[1],
                StoreFlags::NONE,
            )
            .unwrap();
        }

        let mut out = vec![0_u8; 32768];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        assert!(is_valid_gpmf(payload, true));
        let recs = parse(payload);
        let ids: Vec<u32> = find_all(&recs, b"DVID").iter().map(|r| u32_of(r)).collect();
        assert_eq!(ids, vec![2, 9]);
    }

    #[test]
    fn reset_clears_data_keeps_declarations() {
        let writer = GpmfWriter::new();
        let strm = writer
            .stream_open(Channel::Timed, Some(1), "cam", None, 8192)
            .unwrap();

        strm.store(FourCC(*b"STNM"), SampleType::Ascii, 1, 4, b"Gyro", StoreFlags::STICKY)
            .unwrap();
        strm.store(
            FourCC(*b"GYRO"),
            SampleType::SignedShort,
            2,
            1,
            &ne_i16(&[5]),
            StoreFlags::NONE,
        )
        .unwrap();
        strm.reset();
        strm.store(
            FourCC(*b"GYRO"),
            SampleType::SignedShort,
            2,
            1,
            &ne_i16(&[6]),
            StoreFlags::NONE,
        )
        .unwrap();

        let mut out = vec![0_u8; 16384];
        let payload = writer.get_payload(Channel::Timed, &mut out).unwrap();
        let recs = parse(payload);
        assert_eq!(&find(&recs, b"STNM").unwrap().data, b"Gyro");
        let gyro = find(&recs, b"GYRO").unwrap();
        assert_eq!(i16_samples(gyro), vec![6], "pre-reset samples are gone");
        assert_eq!(u32_of(find(&recs, b"TSMP").unwrap()), 1, "counter restarts");
    }

    #[test]
    fn parallel_producers_with_spinning_drain() {
        let writer = GpmfWriter::new();
        const PRODUCERS: usize = 4;
        const STORES: u32 = 200;

        let keys: [[u8; 4]; PRODUCERS] = [*b"THDa", *b"THDb", *b"THDc", *b"THDd"];
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|i| {
                writer
                    .stream_open(Channel::Timed, Some(2 + i as u32), "worker", None, 32768)
                    .unwrap()
            })
            .collect();

        let mut per_key_total = vec![0_u64; PRODUCERS];
        std::thread::scope(|scope| {
            for (i, handle) in handles.iter().enumerate() {
                let key = keys[i];
                scope.spawn(move || {
                    for v in 0..STORES {
                        handle
                            .store(
                                FourCC(key),
                                SampleType::UnsignedLong,
                                4,
                                1,
                                &v.to_ne_bytes(),
                                StoreFlags::NONE,
                            )
                            .unwrap();
                        if v % 50 == 0 {
                            std::thread::yield_now();
                        }
                    }
                });
            }

            // drain concurrently with the producers
            let mut out = vec![0_u8; 262144];
            for _ in 0..20 {
                match writer.get_payload(Channel::Timed, &mut out) {
                    Ok(payload) => {
                        assert!(is_valid_gpmf(payload, true));
                        let recs = parse(payload);
                        for (i, key) in keys.iter().enumerate() {
                            for rec in find_all(&recs, key) {
                                per_key_total[i] += rec.repeat as u64;
                            }
                        }
                    }
                    Err(GpmfError::EmptyData) => (),
                    Err(err) => panic!("drain failed: {err}"),
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        // producers joined: collect whatever is still pending
        let mut out = vec![0_u8; 262144];
        if let Ok(payload) = writer.get_payload(Channel::Timed, &mut out) {
            assert!(is_valid_gpmf(payload, true));
            let recs = parse(payload);
            for (i, key) in keys.iter().enumerate() {
                for rec in find_all(&recs, key) {
                    per_key_total[i] += rec.repeat as u64;
                }
            }
        }

        for (i, total) in per_key_total.iter().enumerate() {
            assert_eq!(
                *total, STORES as u64,
                "stream {i}: union of drained samples matches stores"
            );
        }
    }
}
