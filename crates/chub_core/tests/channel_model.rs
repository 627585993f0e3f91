use chub_common::ipc;
use chub_core::ChannelId;
use chub_core::IpcError;
use chub_core::ring::{DataChannel, EventSlot, RingChannel, RingLayout, SlotState};
use chub_core::window::SharedWindow;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

fn data_channel(window: &SharedWindow) -> DataChannel {
    DataChannel::new(ChannelId::DataToDevice, window.clone(), RingLayout::data())
}

#[test]
fn data_channel_matches_a_queue_model() {
    let window = SharedWindow::allocate(ipc::DATA_CHANNEL_BYTES);
    let channel = data_channel(&window);
    channel.reset();
    let mut model: VecDeque<Vec<u8>> = VecDeque::new();
    let mut rng = StdRng::seed_from_u64(0x1234_5678_9abc_def0);

    for _ in 0..20_000 {
        match rng.gen_range(0..3) {
            0 => {
                let len = rng.gen_range(0..=ipc::PACKET_SIZE_MAX);
                let msg: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
                match channel.enqueue(&msg) {
                    Ok(()) => model.push_back(msg),
                    Err(IpcError::QueueFull { .. }) => {
                        assert_eq!(model.len(), ipc::DATA_SLOTS as usize - 1)
                    }
                    Err(err) => panic!("unexpected {err}"),
                }
            }
            1 => match channel.dequeue().unwrap() {
                Some(got) => assert_eq!(Some(got), model.pop_front()),
                None => assert!(model.is_empty()),
            },
            _ => {
                assert_eq!(channel.len().unwrap() as usize, model.len());
                assert!(model.len() < ipc::DATA_SLOTS as usize);
            }
        }
    }
}

#[test]
fn event_ring_matches_a_queue_model() {
    let window = SharedWindow::allocate(ipc::EVENT_CHANNEL_BYTES);
    let ring = RingChannel::<EventSlot>::new(ChannelId::EventToHost, window, RingLayout::event());
    ring.reset();
    let mut model: VecDeque<u32> = VecDeque::new();
    let mut rng = StdRng::seed_from_u64(7);

    for step in 0..20_000u32 {
        if rng.gen_bool(0.55) {
            let slot = EventSlot {
                code: step,
                line: step % 15,
                state: SlotState::Enqueued,
            };
            match ring.enqueue(&slot) {
                Ok(()) => model.push_back(step),
                Err(IpcError::QueueFull { .. }) => {
                    assert_eq!(model.len(), ipc::EVENT_SLOTS as usize)
                }
                Err(err) => panic!("unexpected {err}"),
            }
        } else {
            let got = ring.dequeue().unwrap().map(|slot| slot.code);
            assert_eq!(got, model.pop_front());
        }
    }
}

#[test]
fn producer_and_consumer_on_separate_views() {
    const MESSAGES: u32 = 5_000;

    let window = SharedWindow::allocate(ipc::DATA_CHANNEL_BYTES);
    let producer = Arc::new(data_channel(&window));
    producer.reset();
    let consumer = data_channel(&window);

    let tx = producer.clone();
    let handle = thread::spawn(move || {
        for seq in 0..MESSAGES {
            let msg = seq.to_le_bytes();
            loop {
                match tx.enqueue(&msg) {
                    Ok(()) => break,
                    Err(IpcError::QueueFull { .. }) => std::hint::spin_loop(),
                    Err(err) => panic!("producer: {err}"),
                }
            }
        }
    });

    let mut expected = 0;
    while expected < MESSAGES {
        if let Some(msg) = consumer.dequeue().unwrap() {
            assert_eq!(msg, expected.to_le_bytes());
            expected += 1;
        } else {
            std::hint::spin_loop();
        }
    }
    handle.join().unwrap();
    assert!(consumer.is_empty().unwrap());
}
