mod common;

use std::time::Duration;

use chatsync::engine::Outgoing;
use chatsync::pins::PinChange;
use chatsync::read_state::MarkRead;
use chatsync::{
    ChatId, ChatStatus, ConversationKind, DeliveryStatus, Origin, SyncError, SyncEvent,
};
use tokio::sync::broadcast;

use common::{company_engine, student_engine, world};

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn ids(list: &[chatsync::Conversation]) -> Vec<ChatId> {
    let mut ids: Vec<ChatId> = list.iter().map(|c| c.id).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_student_sees_only_own_conversations() {
    let w = world();
    let dangling = w.remote.add_chat(Origin::JobApplication(424_242));
    let engine = student_engine(&w);

    assert!(engine.refresh_conversations().await.unwrap());
    let list = engine.conversations();

    let mut expected = vec![w.internship, w.backend_job, w.outreach, w.orphan];
    expected.sort();
    assert_eq!(ids(&list), expected);
    assert!(!list.iter().any(|c| c.id == w.foreign || c.id == dangling));

    let internship = engine.conversation(w.internship).unwrap();
    assert_eq!(internship.display_name, "Acme");
    assert_eq!(internship.title, "Rust Intern");
    assert_eq!(internship.avatar_url, "https://cdn.example.com/rita.png");
    assert_eq!(internship.counterpart, Some(w.recruiter));

    // No company profile behind the job: generic name and generated avatar
    let orphan = engine.conversation(w.orphan).unwrap();
    assert_eq!(orphan.display_name, "Company");
    assert!(orphan.avatar_url.starts_with("https://ui-avatars.com/api/?name=C"));

    let outreach = engine.conversation(w.outreach).unwrap();
    assert_eq!(outreach.kind, ConversationKind::Resume);
    assert_eq!(outreach.title, "Data Analyst");
    assert_eq!(outreach.last_message, "We liked your resume");
}

#[tokio::test]
async fn test_company_sees_applicants() {
    let w = world();
    let engine = company_engine(&w);
    engine.refresh_conversations().await.unwrap();
    let list = engine.conversations();

    let mut expected = vec![w.internship, w.backend_job, w.outreach, w.foreign];
    expected.sort();
    assert_eq!(ids(&list), expected);
    assert_eq!(engine.conversation(w.foreign).unwrap().display_name, "Grace Hopper");
    assert_eq!(engine.conversation(w.outreach).unwrap().display_name, "Ada Lovelace");
}

#[tokio::test]
async fn test_opening_chat_with_unread_message_marks_it_read() {
    let w = world();
    let m1 = w.remote.add_message(w.internship, w.recruiter, "Hello Ada", false);
    let engine = student_engine(&w);
    let mut events = engine.subscribe();

    engine.refresh_conversations().await.unwrap();
    assert_eq!(engine.total_unread(), 1);
    assert_eq!(engine.conversation(w.internship).unwrap().unread_count, 1);

    engine.select_conversation(Some(w.internship)).await.unwrap();

    assert!(w.remote.message(m1).unwrap().read);
    assert_eq!(engine.total_unread(), 0);
    assert_eq!(engine.conversation(w.internship).unwrap().unread_count, 0);
    let messages = engine.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].message.read);

    let badge: Vec<u32> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::UnreadCountChanged { total } => Some(total),
            _ => None,
        })
        .collect();
    assert_eq!(badge, vec![1, 0]);

    // Closing the chat does not bring the badge back
    engine.select_conversation(None).await.unwrap();
    engine.refresh_conversations().await.unwrap();
    assert_eq!(engine.total_unread(), 0);
}

#[tokio::test]
async fn test_mark_read_twice_flips_each_message_once() {
    let w = world();
    w.remote.add_message(w.backend_job, w.recruiter, "one", false);
    w.remote.add_message(w.backend_job, w.recruiter, "two", false);
    w.remote.add_message(w.backend_job, w.student, "mine", false);
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();
    assert_eq!(engine.total_unread(), 2);

    assert!(matches!(engine.mark_read(w.backend_job).await.unwrap(), MarkRead::Marked { .. }));
    assert_eq!(engine.total_unread(), 0);
    assert_eq!(w.remote.read_transitions(), 2);

    engine.mark_read(w.backend_job).await.unwrap();
    engine.refresh_conversations().await.unwrap();
    assert_eq!(engine.total_unread(), 0);
    assert_eq!(w.remote.read_transitions(), 2);

    // The viewer's own message is never touched
    let own = w
        .remote
        .messages_in(w.backend_job)
        .into_iter()
        .find(|m| m.sender == w.student)
        .unwrap();
    assert!(!own.read);
}

#[tokio::test]
async fn test_fourth_pin_is_rejected() {
    let w = world();
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();

    for chat in [w.internship, w.backend_job, w.outreach] {
        assert_eq!(engine.toggle_pin(chat).await.unwrap(), PinChange::Pinned);
    }
    w.remote.reset_calls();

    let err = engine.toggle_pin(w.orphan).await.unwrap_err();
    assert!(matches!(err, SyncError::PinCapacity { max: 3 }));
    assert_eq!(w.remote.write_calls(), 0);

    let mut pinned = engine.pinned();
    pinned.sort();
    let mut expected = vec![w.internship, w.backend_job, w.outreach];
    expected.sort();
    assert_eq!(pinned, expected);

    // Pinned conversations lead the list
    let list = engine.conversations();
    assert!(list[..3].iter().all(|c| c.is_pinned));
    assert_eq!(list[3].id, w.orphan);
    assert!(!list[3].is_pinned);
}

#[tokio::test]
async fn test_pins_from_another_device_win_on_refresh() {
    let w = world();
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();
    engine.toggle_pin(w.internship).await.unwrap();

    w.remote.add_pin(w.student, w.outreach);
    engine.refresh_conversations().await.unwrap();

    assert!(engine.conversation(w.outreach).unwrap().is_pinned);
    assert!(engine.conversation(w.internship).unwrap().is_pinned);
}

#[tokio::test(start_paused = true)]
async fn test_offline_send_is_shown_then_rolled_back() {
    let w = world();
    w.remote.add_message(w.internship, w.recruiter, "Hello Ada", true);
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();
    engine.select_conversation(Some(w.internship)).await.unwrap();
    let before = engine.messages();
    let mut events = engine.subscribe();

    w.remote.set_offline(true);
    w.remote.set_latency_for("create_message", Duration::from_millis(500));
    let sender = engine.clone();
    let send = tokio::spawn(async move { sender.send_message(Outgoing::Text("Are you there?".into())).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let during = engine.messages();
    assert_eq!(during.len(), before.len() + 1);
    let pending = during.last().unwrap();
    assert_eq!(pending.status, DeliveryStatus::Pending);
    assert!(pending.local_id.starts_with("temp-"));
    assert_eq!(pending.message.content, "Are you there?");

    let result = send.await.unwrap();
    assert!(matches!(result, Err(SyncError::Remote(_))));
    assert_eq!(engine.messages(), before);
    assert_eq!(w.remote.calls("create_message"), 3);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::SendFailed { chat, .. } if *chat == w.internship)));
}

#[tokio::test]
async fn test_send_confirms_and_updates_preview() {
    let w = world();
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();
    engine.select_conversation(Some(w.backend_job)).await.unwrap();

    let saved = engine
        .send_message(Outgoing::Text("  Looking forward to it  ".into()))
        .await
        .unwrap();
    assert_eq!(saved.content, "Looking forward to it");

    let messages = engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, DeliveryStatus::Confirmed);
    assert_eq!(messages[0].local_id, saved.id.to_string());

    let conversation = engine.conversation(w.backend_job).unwrap();
    assert_eq!(conversation.last_message, "Looking forward to it");
    assert_eq!(conversation.last_message_at, saved.created_at);
    assert_eq!(engine.conversations()[0].id, w.backend_job);

    // Own messages never count as unread
    assert_eq!(engine.total_unread(), 0);
}

#[tokio::test]
async fn test_send_rejects_invalid_input_before_any_write() {
    let w = world();
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();

    assert!(matches!(
        engine.send_message(Outgoing::Text("hi".into())).await,
        Err(SyncError::NoConversationSelected)
    ));

    engine.select_conversation(Some(w.internship)).await.unwrap();
    w.remote.reset_calls();
    assert!(matches!(
        engine.send_message(Outgoing::Text("   ".into())).await,
        Err(SyncError::EmptyMessage)
    ));
    assert!(matches!(
        engine
            .send_message(Outgoing::Attachment {
                file_url: "https://cdn.example.com/setup.exe".into(),
                file_name: "setup.exe".into(),
                mime_type: "application/x-msdownload".into(),
                size: 1,
            })
            .await,
        Err(SyncError::UnsupportedAttachment(_))
    ));
    assert_eq!(w.remote.write_calls(), 0);
    assert!(engine.messages().is_empty());

    assert!(matches!(
        engine.select_conversation(Some(w.foreign)).await,
        Err(SyncError::UnknownConversation(_))
    ));
}

#[tokio::test]
async fn test_attachment_and_resume_messages() {
    let w = world();
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();
    engine.select_conversation(Some(w.internship)).await.unwrap();

    let image = engine
        .send_message(Outgoing::Attachment {
            file_url: "https://cdn.example.com/portfolio.png".into(),
            file_name: "portfolio.png".into(),
            mime_type: "image/png".into(),
            size: 52_000,
        })
        .await
        .unwrap();
    assert_eq!(image.message_type, chatsync::MessageType::Image);
    assert_eq!(
        image.metadata.as_ref().and_then(|m| m.file_url.as_deref()),
        Some("https://cdn.example.com/portfolio.png")
    );

    let resume = engine
        .send_message(Outgoing::Resume { resume: 77, note: Some("My CV".into()) })
        .await
        .unwrap();
    assert_eq!(resume.message_type, chatsync::MessageType::Resume);
    assert_eq!(resume.content, "My CV");
    assert_eq!(resume.metadata.and_then(|m| m.resume_id), Some(77));
}

#[tokio::test]
async fn test_status_transitions() {
    let w = world();
    let engine = company_engine(&w);
    engine.refresh_conversations().await.unwrap();
    engine.select_conversation(Some(w.internship)).await.unwrap();

    engine.update_status(w.internship, ChatStatus::Blocked).await.unwrap();
    assert_eq!(engine.conversation(w.internship).unwrap().status, ChatStatus::Blocked);
    assert!(matches!(
        engine.send_message(Outgoing::Text("hello?".into())).await,
        Err(SyncError::ChatNotWritable { status: ChatStatus::Blocked, .. })
    ));

    engine.update_status(w.internship, ChatStatus::Active).await.unwrap();
    engine.send_message(Outgoing::Text("unblocked".into())).await.unwrap();

    engine.update_status(w.internship, ChatStatus::Closed).await.unwrap();
    assert_eq!(w.remote.chat(w.internship).unwrap().status, ChatStatus::Closed);
    assert!(matches!(
        engine.update_status(w.internship, ChatStatus::Active).await,
        Err(SyncError::InvalidStatusTransition { from: ChatStatus::Closed, to: ChatStatus::Active, .. })
    ));
}

#[tokio::test]
async fn test_clear_keeps_conversation_and_delete_removes_it() {
    let w = world();
    w.remote.add_message(w.internship, w.recruiter, "first", false);
    w.remote.add_message(w.internship, w.student, "second", false);
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();
    engine.toggle_pin(w.internship).await.unwrap();
    engine.select_conversation(Some(w.internship)).await.unwrap();

    engine.clear_conversation(w.internship).await.unwrap();
    assert!(w.remote.messages_in(w.internship).is_empty());
    assert!(engine.messages().is_empty());
    let cleared = engine.conversation(w.internship).unwrap();
    assert_eq!(cleared.last_message, "");
    assert_eq!(cleared.last_message_at, w.remote.chat(w.internship).unwrap().created_at);

    engine.delete_conversation(w.internship).await.unwrap();
    assert!(w.remote.chat(w.internship).is_none());
    assert!(engine.conversation(w.internship).is_none());
    assert_eq!(engine.selected(), None);
    assert!(engine.pinned().is_empty());
    assert!(w.remote.pinned(w.student).is_empty());
}

#[tokio::test]
async fn test_start_conversation_adds_it_to_the_list() {
    let w = world();
    let job = w.remote.add_job(chatsync::CompanyRef::Id(w.company), "Data Engineer");
    let application = w.remote.add_job_application(w.student, job);
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();

    let chat = engine
        .start_conversation(Origin::JobApplication(application))
        .await
        .unwrap();

    assert_eq!(chat.status, ChatStatus::Active);
    let conversation = engine.conversation(chat.id).unwrap();
    assert_eq!(conversation.title, "Data Engineer");
    assert_eq!(conversation.display_name, "Acme");
}

#[tokio::test]
async fn test_search_and_server_unread_count() {
    let w = world();
    w.remote.add_message(w.outreach, w.recruiter, "ping", false);
    w.remote.add_message(w.outreach, w.student, "pong", false);
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();

    let found = engine.search("data");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, w.outreach);
    assert_eq!(engine.search("ACME").len(), 3);
    assert!(engine.search("nothing like this").is_empty());

    assert_eq!(engine.remote_unread_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_refresh_keeps_last_good_list() {
    let w = world();
    w.remote.add_message(w.internship, w.recruiter, "hi", false);
    let engine = student_engine(&w);
    engine.refresh_conversations().await.unwrap();
    let before = engine.conversations();

    w.remote.set_offline(true);
    assert!(engine.refresh_conversations().await.is_err());
    assert_eq!(engine.conversations(), before);
    assert_eq!(engine.total_unread(), 1);
}
