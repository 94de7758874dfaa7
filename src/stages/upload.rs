use async_trait::async_trait;

use super::{IngestedEvent, TranscribedEvent};
use crate::blob::content_type_for;
use crate::model::{
    Body, Event, EventMinutesItem, File, MinutesItem, MinutesItemFile, Person, Transcript, Vote,
};
use crate::recorder::{ActiveRun, RunValue};
use crate::stage::{Stage, StageError};
use crate::store::UpsertStore;

/// Upsert the item's entity graph in dependency order.
///
/// Every write is a find-or-create on the entity's key, so a retried
/// partial upload resolves to the ids it already created.
pub struct UploadStage {
    store: UpsertStore,
}

impl UploadStage {
    pub fn new(store: UpsertStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for UploadStage {
    type Input = TranscribedEvent;
    type Output = IngestedEvent;

    fn name(&self) -> &'static str {
        "upload"
    }

    async fn execute(
        &self,
        input: TranscribedEvent,
        run: &ActiveRun,
    ) -> Result<IngestedEvent, StageError> {
        let source = &input.source;
        run.register_input(RunValue::Stored(input.transcript_uri.clone()))
            .await?;

        let body = self
            .store
            .get_or_upload(&Body {
                name: source.body.name.clone(),
                description: source.body.description.clone(),
            })
            .await?;

        let event = self
            .store
            .get_or_upload(&Event {
                body_id: body.id.clone(),
                event_datetime: source.event_datetime,
                source_uri: source.source_uri.clone(),
                video_uri: source.video_uri.clone(),
                agenda_file_uri: source.agenda_file_uri.clone(),
                minutes_file_uri: source.minutes_file_uri.clone(),
                external_event_id: source.external_event_id.clone(),
            })
            .await?;

        for (index, item) in source.agenda_items.iter().enumerate() {
            let minutes_item = self
                .store
                .get_or_upload(&MinutesItem {
                    name: item.name.clone(),
                    matter: item.matter.clone(),
                    external_item_id: item.external_item_id.clone(),
                })
                .await?;

            for attachment in &item.attachments {
                let file = self
                    .store
                    .get_or_upload(&File::from_uri(
                        attachment.uri.clone(),
                        content_type_for(&attachment.uri),
                    ))
                    .await?;
                self.store
                    .get_or_upload(&MinutesItemFile {
                        minutes_item_id: minutes_item.id.clone(),
                        file_id: file.id,
                        name: attachment.name.clone(),
                    })
                    .await?;
            }

            let event_minutes_item = self
                .store
                .get_or_upload(&EventMinutesItem {
                    event_id: event.id.clone(),
                    minutes_item_id: minutes_item.id,
                    index: index as i64,
                    decision: item.decision.clone(),
                })
                .await?;

            for vote in &item.votes {
                let person = self
                    .store
                    .get_or_upload(&Person {
                        full_name: vote.person.full_name.clone(),
                        email: vote.person.email.clone(),
                        phone: vote.person.phone.clone(),
                        website: vote.person.website.clone(),
                        external_person_id: vote.person.external_person_id.clone(),
                    })
                    .await?;
                self.store
                    .get_or_upload(&Vote {
                        person_id: person.id,
                        event_minutes_item_id: event_minutes_item.id.clone(),
                        decision: vote.decision.clone(),
                        external_vote_id: vote.external_vote_id.clone(),
                    })
                    .await?;
            }
        }

        let transcript_file = self
            .store
            .get_or_upload(&File::from_uri(
                input.transcript_uri.clone(),
                content_type_for(&input.transcript_uri),
            ))
            .await?;
        let transcript = self
            .store
            .get_or_upload(&Transcript {
                event_id: event.id.clone(),
                file_id: transcript_file.id,
                confidence: input.confidence,
            })
            .await?;

        run.register_output(RunValue::typed("event_id", event.id.as_str()))
            .await?;
        run.register_output(RunValue::typed("transcript_id", transcript.id.as_str()))
            .await?;
        tracing::info!(
            event_id = %event.id,
            items = source.agenda_items.len(),
            "Entity graph uploaded"
        );

        Ok(IngestedEvent { event, transcript })
    }
}
