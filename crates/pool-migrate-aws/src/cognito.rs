use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use async_trait::async_trait;
use aws_sdk_cognitoidentityprovider::operation::admin_create_user::AdminCreateUserError;
use aws_sdk_cognitoidentityprovider::operation::admin_get_user::AdminGetUserError;
use aws_sdk_cognitoidentityprovider::operation::create_group::CreateGroupError;
use aws_sdk_cognitoidentityprovider::operation::describe_user_pool::DescribeUserPoolError;
use aws_sdk_cognitoidentityprovider::primitives::{DateTime, DateTimeFormat};
use aws_sdk_cognitoidentityprovider::types::{
    AttributeType, DeliveryMediumType, GroupType, MessageActionType, MfaOptionType,
    SchemaAttributeType, UserPoolType, UserType,
};
use aws_sdk_cognitoidentityprovider::Client;
use pool_migrate_core::{
    Attribute, BackendError, Delivery, Directory, ErrorKind, Group, NewUser, PoolMetadata, User,
    UserPage, UserStatus,
};
use serde_json::{Map, Value};

use crate::sdk_error;

/// Cognito user pool directory.
#[derive(Debug, Clone)]
pub struct CognitoDirectory {
    client: Client,
}

impl CognitoDirectory {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn timestamp(value: Option<&DateTime>) -> Option<Value> {
    value.and_then(|value| value.fmt(DateTimeFormat::DateTime).ok()).map(Value::String)
}

fn insert_some(extra: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        extra.insert(key.to_string(), value);
    }
}

fn text(value: Option<&str>) -> Option<Value> {
    value.map(Value::from)
}

fn label<T: AsRef<str>>(value: Option<&T>) -> Option<Value> {
    value.map(|value| Value::from(value.as_ref()))
}

fn labels<T: AsRef<str>>(values: &[T]) -> Option<Value> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().map(|value| Value::from(value.as_ref())).collect())
}

/// Nested settings blocks are carried as their debug rendering.
fn rendered<T: Debug>(value: Option<&T>) -> Option<Value> {
    value.map(|value| Value::String(format!("{value:?}")))
}

fn tags(values: Option<&HashMap<String, String>>) -> Option<Value> {
    let sorted: BTreeMap<&String, &String> = values?.iter().collect();
    Some(Value::Object(
        sorted.into_iter().map(|(key, value)| (key.clone(), Value::from(value.as_str()))).collect(),
    ))
}

fn object(entries: impl IntoIterator<Item = (&'static str, Option<Value>)>) -> Value {
    let mut map = Map::new();
    for (key, value) in entries {
        insert_some(&mut map, key, value);
    }
    Value::Object(map)
}

fn mfa_option(option: &MfaOptionType) -> Value {
    object([
        ("DeliveryMedium", label(option.delivery_medium())),
        ("AttributeName", text(option.attribute_name())),
    ])
}

fn schema_attribute(attribute: &SchemaAttributeType) -> Value {
    object([
        ("Name", text(attribute.name())),
        ("AttributeDataType", label(attribute.attribute_data_type())),
        ("DeveloperOnlyAttribute", attribute.developer_only_attribute().map(Value::Bool)),
        ("Mutable", attribute.mutable().map(Value::Bool)),
        ("Required", attribute.required().map(Value::Bool)),
        (
            "NumberAttributeConstraints",
            attribute.number_attribute_constraints().map(|limits| {
                object([
                    ("MinValue", text(limits.min_value())),
                    ("MaxValue", text(limits.max_value())),
                ])
            }),
        ),
        (
            "StringAttributeConstraints",
            attribute.string_attribute_constraints().map(|limits| {
                object([
                    ("MinLength", text(limits.min_length())),
                    ("MaxLength", text(limits.max_length())),
                ])
            }),
        ),
    ])
}

fn attributes_from(attributes: &[AttributeType]) -> Vec<Attribute> {
    attributes
        .iter()
        .map(|attribute| Attribute::new(attribute.name(), attribute.value().unwrap_or_default()))
        .collect()
}

fn attributes_to(attributes: &[Attribute]) -> Result<Vec<AttributeType>, BackendError> {
    attributes
        .iter()
        .map(|attribute| {
            AttributeType::builder()
                .name(&attribute.name)
                .value(&attribute.value)
                .build()
                .map_err(|err| sdk_error(&err, ErrorKind::Other))
        })
        .collect()
}

fn user_from(user: &UserType) -> User {
    let mut extra = Map::new();
    insert_some(&mut extra, "UserCreateDate", timestamp(user.user_create_date()));
    insert_some(&mut extra, "UserLastModifiedDate", timestamp(user.user_last_modified_date()));
    extra.insert("Enabled".to_string(), Value::Bool(user.enabled()));
    if !user.mfa_options().is_empty() {
        extra.insert(
            "MFAOptions".to_string(),
            user.mfa_options().iter().map(mfa_option).collect(),
        );
    }

    User {
        username: user.username().unwrap_or_default().to_string(),
        attributes: attributes_from(user.attributes()),
        status: user.user_status().map(|status| UserStatus::parse(status.as_str())),
        groups: Vec::new(),
        extra,
    }
}

fn group_from(group: &GroupType) -> Group {
    let mut extra = Map::new();
    insert_some(&mut extra, "UserPoolId", text(group.user_pool_id()));
    insert_some(&mut extra, "RoleArn", text(group.role_arn()));
    insert_some(&mut extra, "CreationDate", timestamp(group.creation_date()));
    insert_some(&mut extra, "LastModifiedDate", timestamp(group.last_modified_date()));

    Group {
        name: group.group_name().unwrap_or_default().to_string(),
        description: group.description().map(str::to_string),
        precedence: group.precedence(),
        extra,
    }
}

fn pool_from(pool: &UserPoolType) -> PoolMetadata {
    let mut extra = Map::new();
    let fields = [
        ("Policies", rendered(pool.policies())),
        ("DeletionProtection", label(pool.deletion_protection())),
        ("LambdaConfig", rendered(pool.lambda_config())),
        ("LastModifiedDate", timestamp(pool.last_modified_date())),
        ("CreationDate", timestamp(pool.creation_date())),
        (
            "SchemaAttributes",
            Some(pool.schema_attributes())
                .filter(|attributes| !attributes.is_empty())
                .map(|attributes| attributes.iter().map(schema_attribute).collect()),
        ),
        ("AutoVerifiedAttributes", labels(pool.auto_verified_attributes())),
        ("AliasAttributes", labels(pool.alias_attributes())),
        ("UsernameAttributes", labels(pool.username_attributes())),
        ("SmsVerificationMessage", text(pool.sms_verification_message())),
        ("EmailVerificationMessage", text(pool.email_verification_message())),
        ("EmailVerificationSubject", text(pool.email_verification_subject())),
        ("VerificationMessageTemplate", rendered(pool.verification_message_template())),
        ("SmsAuthenticationMessage", text(pool.sms_authentication_message())),
        ("UserAttributeUpdateSettings", rendered(pool.user_attribute_update_settings())),
        ("MfaConfiguration", label(pool.mfa_configuration())),
        ("DeviceConfiguration", rendered(pool.device_configuration())),
        ("EstimatedNumberOfUsers", Some(Value::from(pool.estimated_number_of_users()))),
        ("EmailConfiguration", rendered(pool.email_configuration())),
        ("SmsConfiguration", rendered(pool.sms_configuration())),
        ("UserPoolTags", tags(pool.user_pool_tags())),
        ("SmsConfigurationFailure", text(pool.sms_configuration_failure())),
        ("EmailConfigurationFailure", text(pool.email_configuration_failure())),
        ("Domain", text(pool.domain())),
        ("CustomDomain", text(pool.custom_domain())),
        ("AdminCreateUserConfig", rendered(pool.admin_create_user_config())),
        ("UserPoolAddOns", rendered(pool.user_pool_add_ons())),
        ("UsernameConfiguration", rendered(pool.username_configuration())),
        ("Arn", text(pool.arn())),
        ("AccountRecoverySetting", rendered(pool.account_recovery_setting())),
    ];
    for (key, value) in fields {
        insert_some(&mut extra, key, value);
    }

    PoolMetadata {
        id: pool.id().map(str::to_string),
        name: pool.name().map(str::to_string),
        extra,
    }
}

#[async_trait]
impl Directory for CognitoDirectory {
    async fn describe_pool(&self, pool_id: &str) -> Result<PoolMetadata, BackendError> {
        let output =
            self.client.describe_user_pool().user_pool_id(pool_id).send().await.map_err(|err| {
                let kind = match err.as_service_error() {
                    Some(DescribeUserPoolError::ResourceNotFoundException(_)) => {
                        ErrorKind::NotFound
                    }
                    _ => ErrorKind::Other,
                };
                sdk_error(&err, kind)
            })?;
        Ok(output.user_pool().map(pool_from).unwrap_or_default())
    }

    async fn list_users(
        &self,
        pool_id: &str,
        next_token: Option<&str>,
    ) -> Result<UserPage, BackendError> {
        let output = self
            .client
            .list_users()
            .user_pool_id(pool_id)
            .set_pagination_token(next_token.map(str::to_string))
            .send()
            .await
            .map_err(|err| sdk_error(&err, ErrorKind::Other))?;

        Ok(UserPage {
            users: output.users().iter().map(user_from).collect(),
            next_token: output.pagination_token().map(str::to_string),
        })
    }

    async fn list_groups(&self, pool_id: &str) -> Result<Vec<Group>, BackendError> {
        let mut groups = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .client
                .list_groups()
                .user_pool_id(pool_id)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|err| sdk_error(&err, ErrorKind::Other))?;
            groups.extend(output.groups().iter().map(group_from));
            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(groups)
    }

    async fn list_groups_for_user(
        &self,
        pool_id: &str,
        username: &str,
    ) -> Result<Vec<String>, BackendError> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .client
                .admin_list_groups_for_user()
                .user_pool_id(pool_id)
                .username(username)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|err| sdk_error(&err, ErrorKind::Other))?;
            names.extend(
                output.groups().iter().filter_map(GroupType::group_name).map(str::to_string),
            );
            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(names)
    }

    async fn create_group(&self, pool_id: &str, group: &Group) -> Result<(), BackendError> {
        self.client
            .create_group()
            .user_pool_id(pool_id)
            .group_name(&group.name)
            .set_description(group.description.clone())
            .set_precedence(group.precedence)
            .send()
            .await
            .map_err(|err| {
                let kind = match err.as_service_error() {
                    Some(CreateGroupError::GroupExistsException(_)) => ErrorKind::AlreadyExists,
                    _ => ErrorKind::Other,
                };
                sdk_error(&err, kind)
            })?;
        Ok(())
    }

    async fn create_user(
        &self,
        pool_id: &str,
        user: &NewUser,
    ) -> Result<Vec<Attribute>, BackendError> {
        let mut request = self
            .client
            .admin_create_user()
            .user_pool_id(pool_id)
            .username(&user.username)
            .set_user_attributes(Some(attributes_to(&user.attributes)?));
        request = match &user.delivery {
            Delivery::Email => request.desired_delivery_mediums(DeliveryMediumType::Email),
            Delivery::Suppressed { temporary_password } => request
                .message_action(MessageActionType::Suppress)
                .temporary_password(temporary_password),
        };

        let output = request.send().await.map_err(|err| {
            let kind = match err.as_service_error() {
                Some(AdminCreateUserError::UsernameExistsException(_)) => ErrorKind::AlreadyExists,
                _ => ErrorKind::Other,
            };
            sdk_error(&err, kind)
        })?;

        Ok(output.user().map(|created| attributes_from(created.attributes())).unwrap_or_default())
    }

    async fn set_user_password(
        &self,
        pool_id: &str,
        username: &str,
        password: &str,
        permanent: bool,
    ) -> Result<(), BackendError> {
        self.client
            .admin_set_user_password()
            .user_pool_id(pool_id)
            .username(username)
            .password(password)
            .permanent(permanent)
            .send()
            .await
            .map_err(|err| sdk_error(&err, ErrorKind::Other))?;
        Ok(())
    }

    async fn add_user_to_group(
        &self,
        pool_id: &str,
        username: &str,
        group_name: &str,
    ) -> Result<(), BackendError> {
        self.client
            .admin_add_user_to_group()
            .user_pool_id(pool_id)
            .username(username)
            .group_name(group_name)
            .send()
            .await
            .map_err(|err| sdk_error(&err, ErrorKind::Other))?;
        Ok(())
    }

    async fn get_user_attributes(
        &self,
        pool_id: &str,
        username: &str,
    ) -> Result<Vec<Attribute>, BackendError> {
        let output = self
            .client
            .admin_get_user()
            .user_pool_id(pool_id)
            .username(username)
            .send()
            .await
            .map_err(|err| {
                let kind = match err.as_service_error() {
                    Some(AdminGetUserError::UserNotFoundException(_)) => ErrorKind::NotFound,
                    _ => ErrorKind::Other,
                };
                sdk_error(&err, kind)
            })?;
        Ok(attributes_from(output.user_attributes()))
    }
}
