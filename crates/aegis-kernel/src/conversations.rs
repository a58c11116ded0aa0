//! Conversational surface operations: rooms, threads, messages.
//!
//! All conversation events are sequenced on the room's stream (with the
//! thread carried as envelope scope), which is what the room live tail
//! replays.

use uuid::Uuid;

use aegis_store_core::NewEvent;
use aegis_types::{ActorRef, EventData, StreamRef};

use crate::{Kernel, KernelError};

impl Kernel {
    /// Create a room; its stream starts with the `room.created` event.
    pub async fn create_room(
        &self,
        workspace_id: Uuid,
        name: String,
        actor: ActorRef,
    ) -> Result<Uuid, KernelError> {
        if name.trim().is_empty() {
            return Err(KernelError::Malformed("room name cannot be empty".into()));
        }
        let room_id = Uuid::new_v4();
        let data = EventData::RoomCreated { room_id, name };
        let mut event = NewEvent::new(
            data.event_type(),
            StreamRef::room(room_id),
            actor,
            data.to_value(),
        )
        .in_room(room_id);
        event.workspace_id = Some(workspace_id);
        self.commit_event(event).await?;
        Ok(room_id)
    }

    /// Open a thread inside a room.
    pub async fn create_thread(
        &self,
        room_id: Uuid,
        title: String,
        actor: ActorRef,
    ) -> Result<Uuid, KernelError> {
        if title.trim().is_empty() {
            return Err(KernelError::Malformed("thread title cannot be empty".into()));
        }
        let thread_id = Uuid::new_v4();
        let data = EventData::ThreadCreated { thread_id, room_id, title };
        let event = NewEvent::new(
            data.event_type(),
            StreamRef::room(room_id),
            actor,
            data.to_value(),
        )
        .in_room(room_id)
        .in_thread(thread_id);
        self.commit_event(event).await?;
        Ok(thread_id)
    }

    /// Post a message to a thread.
    pub async fn post_message(
        &self,
        room_id: Uuid,
        thread_id: Uuid,
        body: String,
        actor: ActorRef,
        idempotency_key: Option<String>,
    ) -> Result<Uuid, KernelError> {
        if body.trim().is_empty() {
            return Err(KernelError::Malformed("message body cannot be empty".into()));
        }
        let message_id = Uuid::new_v4();
        let data = EventData::MessagePosted { message_id, thread_id, body };
        let mut event = NewEvent::new(
            data.event_type(),
            StreamRef::room(room_id),
            actor,
            data.to_value(),
        )
        .in_room(room_id)
        .in_thread(thread_id);
        if let Some(key) = idempotency_key {
            event = event.idempotent(key);
        }
        let receipt = self.commit_event(event).await?;
        // On idempotent replay, hand back the originally recorded message.
        if receipt.replayed {
            if let Ok(EventData::MessagePosted { message_id, .. }) =
                EventData::parse(&receipt.event.event_type, &receipt.event.data)
            {
                return Ok(message_id);
            }
        }
        Ok(message_id)
    }
}
