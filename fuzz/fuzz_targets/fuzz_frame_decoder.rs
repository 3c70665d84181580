#![no_main]

use libfuzzer_sys::fuzz_target;
use presence_ipc::codec::{Frame, FrameDecoder};
use presence_ipc::protocol::PeerMessage;
use presence_ipc::PresenceEvent;

fuzz_target!(|data: &[u8]| {
    // Feed the input in two pieces so both the partial-header and
    // partial-payload paths are exercised.
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let (head, tail) = data.split_at(split);

    let mut decoder = FrameDecoder::with_max_payload(64 * 1024);
    let mut frames: Vec<Frame> = Vec::new();
    for chunk in [head, tail] {
        decoder.extend(chunk);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }

    for frame in frames {
        // Every decoded frame must re-encode to the bytes it came from.
        let encoded = frame.encode().expect("decoded frame re-encodes");
        let mut again = FrameDecoder::with_max_payload(64 * 1024);
        again.extend(&encoded);
        assert_eq!(again.next_frame().ok().flatten().as_ref(), Some(&frame));

        if let Ok(msg) = serde_json::from_slice::<PeerMessage>(&frame.payload) {
            let _ = PresenceEvent::from_peer_message(msg);
        }
    }
});
