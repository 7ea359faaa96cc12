// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The change pipeline: upstream source adapters, the change streamer that
//! owns the durable log and multicasts commits to subscribers, and the
//! replicator that applies them to the local replica.

mod error;
mod replicator;
mod source;
mod streamer;
mod subscription;


pub use error::{StreamError, StreamResult};
pub use replicator::Replicator;
pub use source::{ChangeSource, ChannelSource, FramedSource, SourceEvent, SourceStream, SubscribeRequest};
pub use streamer::{ChangeStreamer, ChangeStreamerOptions, SharedPayload, SubscriberHandle};
pub use subscription::{
    subscription_channel, CancelReason, PushOutcome, Subscription, SubscriptionOptions,
    SubscriptionSender,
};
